//! Vault cipher (login, card, identity, note, SSH key) and its merge rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::merge::{self, DiffFinderNode, Lens};

/// Kind of item a cipher holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CipherKind {
    Login,
    SecureNote,
    Card,
    Identity,
    SshKey,
}

/// A single vault item as stored locally.
///
/// `remote_entity` is the last server snapshot this item was synced
/// against. It is the `base` operand when local edits are reconciled with a
/// newer server copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultCipher {
    pub account_id: String,
    pub cipher_id: String,
    pub folder_id: Option<String>,
    pub organization_id: Option<String>,
    pub revision_date: DateTime<Utc>,
    pub deleted_date: Option<DateTime<Utc>>,
    pub kind: CipherKind,
    pub name: Option<String>,
    pub notes: Option<String>,
    pub favorite: bool,
    #[serde(default)]
    pub fields: Vec<CustomField>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    pub login: Option<Login>,
    pub card: Option<Card>,
    pub identity: Option<Identity>,
    pub secure_note: Option<SecureNote>,
    pub ssh_key: Option<SshKey>,
    /// Encrypted per-item key, if the item has one.
    pub key: Option<String>,
    pub remote_entity: Option<Box<VaultCipher>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Hidden,
    Boolean,
    Linked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomField {
    pub name: Option<String>,
    pub value: Option<String>,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Login {
    pub username: Option<String>,
    pub password: Option<String>,
    pub password_revision_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub password_history: Vec<PasswordHistory>,
    #[serde(default)]
    pub uris: Vec<LoginUri>,
    pub totp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PasswordHistory {
    pub password: String,
    pub last_used_date: Option<DateTime<Utc>>,
}

/// How a login URI is matched against a site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UriMatch {
    Domain,
    Host,
    StartsWith,
    Exact,
    RegularExpression,
    Never,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginUri {
    pub uri: Option<String>,
    pub match_type: Option<UriMatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub cardholder_name: Option<String>,
    pub brand: Option<String>,
    pub number: Option<String>,
    pub exp_month: Option<String>,
    pub exp_year: Option<String>,
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub title: Option<String>,
    pub first_name: Option<String>,
    pub middle_name: Option<String>,
    pub last_name: Option<String>,
    pub address1: Option<String>,
    pub address2: Option<String>,
    pub address3: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub company: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub ssn: Option<String>,
    pub username: Option<String>,
    pub passport_number: Option<String>,
    pub license_number: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecureNoteKind {
    #[default]
    Generic,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecureNote {
    pub kind: SecureNoteKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SshKey {
    pub private_key: Option<String>,
    pub public_key: Option<String>,
    pub fingerprint: Option<String>,
}

macro_rules! leaf {
    ($ty:ty, $field:ident) => {
        DiffFinderNode::leaf(Lens::optional(|v: &$ty| &v.$field, |v| &mut v.$field))
    };
}

impl VaultCipher {
    /// An empty login cipher for `account_id`.
    pub fn new(account_id: impl Into<String>, cipher_id: impl Into<String>, kind: CipherKind) -> Self {
        Self {
            account_id: account_id.into(),
            cipher_id: cipher_id.into(),
            folder_id: None,
            organization_id: None,
            revision_date: Utc::now(),
            deleted_date: None,
            kind,
            name: None,
            notes: None,
            favorite: false,
            fields: Vec::new(),
            tags: Vec::new(),
            login: None,
            card: None,
            identity: None,
            secure_note: None,
            ssh_key: None,
            key: None,
            remote_entity: None,
        }
    }

    /// Field-level merge rules for ciphers.
    ///
    /// Anything not listed here (ids, folder, organization, revision date,
    /// password history, the item key) is taken from the carrier.
    pub fn merge_rules() -> DiffFinderNode<VaultCipher> {
        DiffFinderNode::group(
            Lens::id(),
            || VaultCipher::new("", "", CipherKind::Login),
            vec![
                leaf!(VaultCipher, name),
                leaf!(VaultCipher, notes),
                DiffFinderNode::leaf(Lens::field(|c: &VaultCipher| &c.favorite, |c| &mut c.favorite)),
                DiffFinderNode::list(Lens::field(|c: &VaultCipher| &c.fields, |c| &mut c.fields)),
                DiffFinderNode::list(Lens::field(|c: &VaultCipher| &c.tags, |c| &mut c.tags)),
                DiffFinderNode::group(
                    Lens::optional(|c: &VaultCipher| &c.login, |c| &mut c.login),
                    Login::default,
                    vec![
                        leaf!(Login, username),
                        leaf!(Login, totp),
                        // password and its revision date are merged independently
                        leaf!(Login, password),
                        leaf!(Login, password_revision_date),
                        DiffFinderNode::list(Lens::field(|l: &Login| &l.uris, |l| &mut l.uris)),
                    ],
                ),
                DiffFinderNode::group(
                    Lens::optional(|c: &VaultCipher| &c.card, |c| &mut c.card),
                    Card::default,
                    vec![
                        leaf!(Card, cardholder_name),
                        leaf!(Card, brand),
                        leaf!(Card, number),
                        leaf!(Card, exp_month),
                        leaf!(Card, exp_year),
                        leaf!(Card, code),
                    ],
                ),
                DiffFinderNode::group(
                    Lens::optional(|c: &VaultCipher| &c.identity, |c| &mut c.identity),
                    Identity::default,
                    vec![
                        leaf!(Identity, title),
                        leaf!(Identity, first_name),
                        leaf!(Identity, middle_name),
                        leaf!(Identity, last_name),
                        leaf!(Identity, address1),
                        leaf!(Identity, address2),
                        leaf!(Identity, address3),
                        leaf!(Identity, city),
                        leaf!(Identity, state),
                        leaf!(Identity, postal_code),
                        leaf!(Identity, country),
                        leaf!(Identity, company),
                        leaf!(Identity, email),
                        leaf!(Identity, phone),
                        leaf!(Identity, ssn),
                        leaf!(Identity, username),
                        leaf!(Identity, passport_number),
                        leaf!(Identity, license_number),
                    ],
                ),
                leaf!(VaultCipher, ssh_key),
            ],
        )
    }

    /// Reconciles this local copy with a newer server copy.
    ///
    /// The base is the snapshot recorded in `remote_entity`. A cipher that
    /// was never synced uses `remote` as its base, so every local edit is
    /// kept. The result records `remote` as its new base.
    pub fn merge_with_remote(&self, remote: &VaultCipher) -> VaultCipher {
        let mut remote = remote.clone();
        remote.remote_entity = None;

        let base = match &self.remote_entity {
            Some(base) => base.as_ref().clone(),
            None => remote.clone(),
        };
        let mut local = self.clone();
        local.remote_entity = None;

        let mut merged = merge::merge_into_remote(&Self::merge_rules(), &base, &local, &remote);
        merged.remote_entity = Some(Box::new(remote));
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn login_cipher(name: &str, username: &str) -> VaultCipher {
        let mut cipher = VaultCipher::new("account", "cipher", CipherKind::Login);
        cipher.revision_date = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        cipher.name = Some(name.to_string());
        cipher.login = Some(Login {
            username: Some(username.to_string()),
            ..Login::default()
        });
        cipher
    }

    fn uri(value: &str) -> LoginUri {
        LoginUri {
            uri: Some(value.to_string()),
            match_type: None,
        }
    }

    #[test]
    fn test_local_name_and_remote_username_are_combined() {
        let base = login_cipher("Mail", "ann");
        let local = login_cipher("Work mail", "ann");
        let remote = login_cipher("Mail", "ann.b");

        let merged = merge::merge_into_remote(&VaultCipher::merge_rules(), &base, &local, &remote);
        assert_eq!(merged.name.as_deref(), Some("Work mail"));
        assert_eq!(
            merged.login.as_ref().and_then(|l| l.username.as_deref()),
            Some("ann.b")
        );
    }

    #[test]
    fn test_unlisted_fields_come_from_remote() {
        let base = login_cipher("Mail", "ann");
        let mut local = login_cipher("Work mail", "ann");
        local.folder_id = Some("local-folder".to_string());
        local.key = Some("2.local".to_string());
        let mut remote = login_cipher("Mail", "ann");
        remote.folder_id = Some("remote-folder".to_string());
        remote.revision_date = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        let merged = merge::merge_into_remote(&VaultCipher::merge_rules(), &base, &local, &remote);
        assert_eq!(merged.folder_id.as_deref(), Some("remote-folder"));
        assert_eq!(merged.revision_date, remote.revision_date);
        assert_eq!(merged.key, None);
        assert_eq!(merged.name.as_deref(), Some("Work mail"));
    }

    #[test]
    fn test_uris_added_on_both_sides_are_kept() {
        let base = login_cipher("Mail", "ann");
        let mut local = base.clone();
        if let Some(login) = local.login.as_mut() {
            login.uris.push(uri("https://mail.example.com"));
        }
        let mut remote = base.clone();
        if let Some(login) = remote.login.as_mut() {
            login.uris.push(uri("https://example.com"));
        }

        let merged = merge::merge_into_remote(&VaultCipher::merge_rules(), &base, &local, &remote);
        let uris = merged.login.map(|l| l.uris).unwrap_or_default();
        assert_eq!(uris, vec![uri("https://mail.example.com"), uri("https://example.com")]);
    }

    #[test]
    fn test_card_added_locally_survives() {
        let base = login_cipher("Mail", "ann");
        let mut local = base.clone();
        local.card = Some(Card {
            number: Some("4111".to_string()),
            ..Card::default()
        });
        let remote = base.clone();

        let merged = merge::merge_into_remote(&VaultCipher::merge_rules(), &base, &local, &remote);
        assert_eq!(merged.card.and_then(|c| c.number).as_deref(), Some("4111"));
    }

    #[test]
    fn test_merge_with_remote_uses_recorded_base() {
        let base = login_cipher("Mail", "ann");
        let mut local = login_cipher("Work mail", "ann");
        local.remote_entity = Some(Box::new(base));
        let remote = login_cipher("Mail", "ann.b");

        let merged = local.merge_with_remote(&remote);
        assert_eq!(merged.name.as_deref(), Some("Work mail"));
        assert_eq!(
            merged.login.as_ref().and_then(|l| l.username.as_deref()),
            Some("ann.b")
        );
        assert_eq!(merged.remote_entity.as_deref(), Some(&remote));
    }

    #[test]
    fn test_merge_with_remote_without_base_keeps_local_edits() {
        let local = login_cipher("Work mail", "ann");
        let remote = login_cipher("Mail", "ann");

        let merged = local.merge_with_remote(&remote);
        assert_eq!(merged.name.as_deref(), Some("Work mail"));
    }

    #[test]
    fn test_merge_rules_lenses_are_lawful() {
        let mut cipher = login_cipher("Mail", "ann");
        cipher.card = Some(Card::default());
        cipher.identity = Some(Identity {
            first_name: Some("Ann".to_string()),
            ..Identity::default()
        });
        cipher.ssh_key = Some(SshKey {
            private_key: None,
            public_key: Some("ssh-ed25519 AAAA".to_string()),
            fingerprint: None,
        });
        assert!(VaultCipher::merge_rules().lenses_are_lawful(&cipher));
    }

    #[test]
    fn test_cipher_json_roundtrip_keeps_base() {
        let mut cipher = login_cipher("Mail", "ann");
        cipher.remote_entity = Some(Box::new(login_cipher("Mail", "old")));
        let json = serde_json::to_string(&cipher).unwrap();
        let back: VaultCipher = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cipher);
    }
}
