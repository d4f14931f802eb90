//! Three-way structural merge.
//!
//! A merge is described by a tree of [`DiffFinderNode`]s. Group nodes focus
//! a sub-object through a [`Lens`] and recurse into their children, leaf
//! nodes focus a single field and hand its three versions to a
//! [`DiffFinder`]. The result is always written into a carrier value
//! (`into`, usually the latest remote), so fields that no rule mentions keep
//! the carrier's value.

pub mod finder;
pub mod lens;

pub use finder::{DiffFinder, ListDiffFinder, ScalarDiffFinder};
pub use lens::Lens;

use std::sync::Arc;

/// Bound shared by every type a merge tree can focus.
pub trait Mergeable: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> Mergeable for T {}

trait MergeNode<S>: Send + Sync {
    fn merge(&self, base: &S, local: &S, remote: &S, into: S) -> S;

    fn lenses_are_lawful(&self, sample: &S) -> bool;
}

/// One node of a merge rule tree over `S`.
pub struct DiffFinderNode<S> {
    inner: Box<dyn MergeNode<S>>,
}

impl<S: Mergeable> DiffFinderNode<S> {
    /// A group focusing `F`. `identity` stands in for a side where the
    /// group is absent while the other side has it.
    pub fn group<F: Mergeable>(
        lens: Lens<S, F>,
        identity: impl Fn() -> F + Send + Sync + 'static,
        children: Vec<DiffFinderNode<F>>,
    ) -> Self {
        Self {
            inner: Box::new(GroupNode {
                lens,
                identity: Arc::new(identity),
                children,
            }),
        }
    }

    /// A leaf merged with [`ScalarDiffFinder`].
    pub fn leaf<F: Mergeable>(lens: Lens<S, F>) -> Self {
        Self::leaf_with(lens, ScalarDiffFinder)
    }

    /// A list leaf merged with [`ListDiffFinder`].
    pub fn list<T: Mergeable>(lens: Lens<S, Vec<T>>) -> Self {
        Self::leaf_with(lens, ListDiffFinder)
    }

    pub fn leaf_with<F: Mergeable>(lens: Lens<S, F>, finder: impl DiffFinder<F> + 'static) -> Self {
        Self {
            inner: Box::new(LeafNode {
                lens,
                finder: Box::new(finder),
            }),
        }
    }

    /// Checks `set(x, get(x)) == x` for every lens in the tree that `sample`
    /// reaches.
    pub fn lenses_are_lawful(&self, sample: &S) -> bool {
        self.inner.lenses_are_lawful(sample)
    }
}

struct GroupNode<S, F> {
    lens: Lens<S, F>,
    identity: Arc<dyn Fn() -> F + Send + Sync>,
    children: Vec<DiffFinderNode<F>>,
}

impl<S: Mergeable, F: Mergeable> MergeNode<S> for GroupNode<S, F> {
    fn merge(&self, base: &S, local: &S, remote: &S, into: S) -> S {
        let local_focus = self.lens.get(local);
        let remote_focus = self.lens.get(remote);
        if local_focus.is_none() && remote_focus.is_none() {
            return self.lens.set(into, None);
        }

        // Untouched locally: the server's version is taken as is.
        let base_focus = self.lens.get(base);
        if base_focus == local_focus {
            return self.lens.set(into, remote_focus);
        }

        let or_identity = |focus: Option<F>| focus.unwrap_or_else(|| (self.identity)());
        let base_focus = or_identity(base_focus);
        let local_focus = or_identity(local_focus);
        let remote_focus = or_identity(remote_focus);
        let into_focus = or_identity(self.lens.get(&into));

        let merged = self.children.iter().fold(into_focus, |acc, child| {
            child.inner.merge(&base_focus, &local_focus, &remote_focus, acc)
        });
        self.lens.set(into, Some(merged))
    }

    fn lenses_are_lawful(&self, sample: &S) -> bool {
        if !self.lens.is_lawful_for(sample) {
            return false;
        }
        match self.lens.get(sample) {
            Some(focus) => self
                .children
                .iter()
                .all(|child| child.inner.lenses_are_lawful(&focus)),
            None => true,
        }
    }
}

struct LeafNode<S, F> {
    lens: Lens<S, F>,
    finder: Box<dyn DiffFinder<F>>,
}

impl<S: Mergeable, F: Mergeable> MergeNode<S> for LeafNode<S, F> {
    fn merge(&self, base: &S, local: &S, remote: &S, into: S) -> S {
        let base_focus = self.lens.get(base);
        let local_focus = self.lens.get(local);
        let remote_focus = self.lens.get(remote);
        let merged = self.finder.compare(
            base_focus.as_ref(),
            local_focus.as_ref(),
            remote_focus.as_ref(),
        );
        self.lens.set(into, merged)
    }

    fn lenses_are_lawful(&self, sample: &S) -> bool {
        self.lens.is_lawful_for(sample)
    }
}

/// Merge `local` and `remote` against their common `base`, writing the
/// result into `into`.
pub fn merge<S: Mergeable>(node: &DiffFinderNode<S>, base: &S, local: &S, remote: &S, into: S) -> S {
    node.inner.merge(base, local, remote, into)
}

/// [`merge`] with the latest remote as the carrier.
pub fn merge_into_remote<S: Mergeable>(node: &DiffFinderNode<S>, base: &S, local: &S, remote: &S) -> S {
    merge(node, base, local, remote, remote.clone())
}
