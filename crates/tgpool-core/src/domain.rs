use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{errors::Error, Result};

/// Registry-assigned account id (numeric, never reused).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub u64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Last known probe result for an account.
///
/// Advisory only: a fresh probe always supersedes it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountStatus {
    #[default]
    Unknown,
    Active,
    Inactive,
    AuthRequired,
    Error,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AccountStatus::Unknown => "Unknown",
            AccountStatus::Active => "Active",
            AccountStatus::Inactive => "Inactive",
            AccountStatus::AuthRequired => "AuthRequired",
            AccountStatus::Error => "Error",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed to reconnect an account without prompting.
///
/// `session` is the persisted authentication artifact (a session file path for
/// user accounts, the token for bot accounts).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub app_id: String,
    pub app_secret: String,
    pub session: String,
}

impl Credential {
    pub fn new(
        app_id: impl Into<String>,
        app_secret: impl Into<String>,
        session: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            app_secret: app_secret.into(),
            session: session.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let app_id = self.app_id.trim();
        if app_id.is_empty() || !app_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::InvalidCredential(
                "app id must be a non-empty number".to_string(),
            ));
        }
        if self.app_secret.trim().is_empty() {
            return Err(Error::InvalidCredential("app secret is empty".to_string()));
        }
        if self.session.trim().is_empty() {
            return Err(Error::InvalidCredential(
                "session reference is empty".to_string(),
            ));
        }
        Ok(())
    }
}

// Secrets stay out of logs and panic messages.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("app_id", &self.app_id)
            .field("app_secret", &"<redacted>")
            .field("session", &"<redacted>")
            .finish()
    }
}

/// A managed credential set for one platform identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub phone_number: String,
    pub credential: Credential,
    pub status: AccountStatus,
}

/// Persisted / exported shape of an account.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: AccountId,
    pub name: String,
    pub phone_number: String,
    pub credential: Credential,
    #[serde(default)]
    pub status: AccountStatus,
}

impl From<Account> for AccountRecord {
    fn from(a: Account) -> Self {
        Self {
            id: a.id,
            name: a.name,
            phone_number: a.phone_number,
            credential: a.credential,
            status: a.status,
        }
    }
}

impl From<AccountRecord> for Account {
    fn from(r: AccountRecord) -> Self {
        Self {
            id: r.id,
            name: r.name,
            phone_number: r.phone_number,
            credential: r.credential,
            status: r.status,
        }
    }
}

/// A joinable group/broadcast target.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChannelRef {
    /// Public username, stored without the leading `@`.
    Public(String),
    /// Private invite hash (`t.me/+hash` or `t.me/joinchat/hash`).
    Invite(String),
}

impl ChannelRef {
    /// Parse one operator-supplied reference. Returns `None` for blank or
    /// unrecognizable input.
    pub fn parse(raw: &str) -> Option<Self> {
        let s = raw.trim();
        if s.is_empty() {
            return None;
        }

        let s = s
            .strip_prefix("https://")
            .or_else(|| s.strip_prefix("http://"))
            .unwrap_or(s);
        let s = ["www.t.me/", "t.me/", "telegram.me/"]
            .iter()
            .find_map(|host| s.strip_prefix(host))
            .unwrap_or(s);
        let s = s.trim_end_matches('/');

        if let Some(hash) = s.strip_prefix('+').or_else(|| s.strip_prefix("joinchat/")) {
            return is_token(hash).then(|| ChannelRef::Invite(hash.to_string()));
        }

        let name = s.strip_prefix('@').unwrap_or(s);
        is_token(name).then(|| ChannelRef::Public(name.to_string()))
    }

    /// Parse a newline-separated list, skipping blank and invalid lines.
    pub fn parse_lines(text: &str) -> Vec<Self> {
        text.lines().filter_map(Self::parse).collect()
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Canonical `+<digits>` form of an operator-typed phone number.
///
/// Spaces, dashes, dots and parentheses are dropped; what remains must be
/// 7 to 15 digits (E.164), optionally led by `+`.
pub fn normalize_phone(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix('+').unwrap_or(trimmed);
    let digits: String = digits
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();
    if !(7..=15).contains(&digits.len()) || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(Error::InvalidPhone(raw.to_string()));
    }
    Ok(format!("+{digits}"))
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRef::Public(name) => write!(f, "@{name}"),
            ChannelRef::Invite(hash) => write!(f, "https://t.me/+{hash}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_validation() {
        assert!(Credential::new("12345", "abcdef", "acc.session")
            .validate()
            .is_ok());

        for bad in [
            Credential::new("", "abcdef", "acc.session"),
            Credential::new("12a45", "abcdef", "acc.session"),
            Credential::new("12345", "  ", "acc.session"),
            Credential::new("12345", "abcdef", ""),
        ] {
            assert!(matches!(bad.validate(), Err(Error::InvalidCredential(_))));
        }
    }

    #[test]
    fn credential_debug_redacts_secrets() {
        let c = Credential::new("12345", "topsecret", "/home/me/acc.session");
        let dbg = format!("{c:?}");
        assert!(dbg.contains("12345"));
        assert!(!dbg.contains("topsecret"));
        assert!(!dbg.contains("acc.session"));
    }

    #[test]
    fn phone_numbers_are_normalized() {
        assert_eq!(normalize_phone("+1 (555) 010-9999").unwrap(), "+15550109999");
        assert_eq!(normalize_phone("  380501234567 ").unwrap(), "+380501234567");
        for bad in ["", "+", "12345", "+1555abc0001", "++15550001234", "1234567890123456"] {
            assert!(matches!(normalize_phone(bad), Err(Error::InvalidPhone(_))), "{bad}");
        }
    }

    #[test]
    fn status_serializes_as_text() {
        let json = serde_json::to_string(&AccountStatus::AuthRequired).unwrap();
        assert_eq!(json, "\"AuthRequired\"");
        let back: AccountStatus = serde_json::from_str("\"Active\"").unwrap();
        assert_eq!(back, AccountStatus::Active);
    }

    #[test]
    fn record_status_defaults_to_unknown() {
        let raw = r#"{
          "id": 4,
          "name": "main",
          "phone_number": "+100",
          "credential": { "app_id": "1", "app_secret": "s", "session": "x" }
        }"#;
        let rec: AccountRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(rec.id, AccountId(4));
        assert_eq!(rec.status, AccountStatus::Unknown);
    }

    #[test]
    fn channel_ref_accepts_common_forms() {
        let public = ChannelRef::Public("rustlang".to_string());
        for raw in [
            "rustlang",
            "@rustlang",
            "  @rustlang  ",
            "t.me/rustlang",
            "https://t.me/rustlang",
            "https://t.me/rustlang/",
            "http://telegram.me/rustlang",
        ] {
            assert_eq!(ChannelRef::parse(raw), Some(public.clone()), "{raw}");
        }

        let invite = ChannelRef::Invite("AbC_12-x".to_string());
        assert_eq!(ChannelRef::parse("https://t.me/+AbC_12-x"), Some(invite.clone()));
        assert_eq!(ChannelRef::parse("t.me/joinchat/AbC_12-x"), Some(invite));
    }

    #[test]
    fn channel_ref_rejects_garbage() {
        assert_eq!(ChannelRef::parse(""), None);
        assert_eq!(ChannelRef::parse("   "), None);
        assert_eq!(ChannelRef::parse("@"), None);
        assert_eq!(ChannelRef::parse("https://example.com/x"), None);
        assert_eq!(ChannelRef::parse("t.me/+"), None);
    }

    #[test]
    fn channel_ref_parse_lines_skips_blanks() {
        let refs = ChannelRef::parse_lines("@a\n\n  \nt.me/+h1\nnot a channel\n");
        assert_eq!(
            refs,
            vec![
                ChannelRef::Public("a".to_string()),
                ChannelRef::Invite("h1".to_string())
            ]
        );
        assert_eq!(refs[0].to_string(), "@a");
        assert_eq!(refs[1].to_string(), "https://t.me/+h1");
    }
}
