//! Vault item models shared by the store and the sync layer.

mod cipher;

pub use cipher::{
    Card, CipherKind, CustomField, FieldKind, Identity, Login, LoginUri, PasswordHistory,
    SecureNote, SecureNoteKind, SshKey, Tag, UriMatch, VaultCipher,
};
