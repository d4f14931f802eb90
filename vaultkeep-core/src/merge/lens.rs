//! Getter/setter pairs that focus a field of a larger value.

use std::sync::Arc;

type Getter<S, F> = Arc<dyn Fn(&S) -> Option<F> + Send + Sync>;
type Setter<S, F> = Arc<dyn Fn(S, Option<F>) -> S + Send + Sync>;

/// Focuses an optional `F` inside an `S`.
///
/// A lens must be lossless: `set(x, get(x)) == x`. Use
/// [`Lens::is_lawful_for`] in tests to check hand-written lenses.
pub struct Lens<S, F> {
    get: Getter<S, F>,
    set: Setter<S, F>,
}

impl<S, F> Clone for Lens<S, F> {
    fn clone(&self) -> Self {
        Self {
            get: Arc::clone(&self.get),
            set: Arc::clone(&self.set),
        }
    }
}

impl<S: 'static, F: Clone + 'static> Lens<S, F> {
    pub fn new(
        get: impl Fn(&S) -> Option<F> + Send + Sync + 'static,
        set: impl Fn(S, Option<F>) -> S + Send + Sync + 'static,
    ) -> Self {
        Self {
            get: Arc::new(get),
            set: Arc::new(set),
        }
    }

    /// Lens over a required field. Setting `None` leaves the field as is.
    pub fn field(get: fn(&S) -> &F, get_mut: fn(&mut S) -> &mut F) -> Self {
        Self::new(
            move |s| Some(get(s).clone()),
            move |mut s, value| {
                if let Some(value) = value {
                    *get_mut(&mut s) = value;
                }
                s
            },
        )
    }

    /// Lens over an `Option<F>` field.
    pub fn optional(get: fn(&S) -> &Option<F>, get_mut: fn(&mut S) -> &mut Option<F>) -> Self {
        Self::new(
            move |s| get(s).clone(),
            move |mut s, value| {
                *get_mut(&mut s) = value;
                s
            },
        )
    }

    pub fn get(&self, source: &S) -> Option<F> {
        (self.get)(source)
    }

    pub fn set(&self, source: S, focus: Option<F>) -> S {
        (self.set)(source, focus)
    }
}

impl<S: Clone + 'static> Lens<S, S> {
    /// The lens that focuses the whole value.
    pub fn id() -> Self {
        Self::new(
            |s: &S| Some(s.clone()),
            |s, value| value.unwrap_or(s),
        )
    }
}

impl<S: Clone + PartialEq + 'static, F: Clone + 'static> Lens<S, F> {
    pub fn is_lawful_for(&self, sample: &S) -> bool {
        self.set(sample.clone(), self.get(sample)) == *sample
    }
}
