#![forbid(unsafe_code)]

//! Session credential lifecycle.
//!
//! A credential is a cookie map carrying the platform's session token. It is
//! loaded from disk (or supplied by the operator), validated once against the
//! platform, then threaded through a [`SessionContext`] that the search
//! provider reads and opportunistically refreshes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use crate::checkpoint::write_json_atomic;
use crate::error::HarvestError;

pub const SESSION_COOKIE: &str = "SESSDATA";
/// Sessions are treated as valid for seven days after capture.
pub const CREDENTIAL_LIFETIME_SECS: i64 = 7 * 24 * 60 * 60;

const USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub cookies: BTreeMap<String, String>,
    /// Unix seconds.
    pub captured_at: i64,
    pub user_agent: String,
}

impl Credential {
    pub fn from_token(token: &str, now: i64) -> Result<Self, HarvestError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(HarvestError::Credential("empty session token".into()));
        }
        let user_agent = USER_AGENTS
            .choose(&mut rand::rng())
            .unwrap_or(&USER_AGENTS[0])
            .to_string();
        Ok(Self {
            cookies: BTreeMap::from([(SESSION_COOKIE.to_string(), token.to_string())]),
            captured_at: now,
            user_agent,
        })
    }

    pub fn token(&self) -> Option<&str> {
        self.cookies
            .get(SESSION_COOKIE)
            .map(String::as_str)
            .filter(|token| !token.is_empty())
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now.saturating_sub(self.captured_at) >= CREDENTIAL_LIFETIME_SECS
    }

    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Confirms a credential is accepted by the platform.
pub trait CredentialValidator {
    fn validate(&self, credential: &Credential) -> Result<bool, HarvestError>;
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
    /// Cookie JSON read by the fetch tool, refreshed on every save.
    export_path: Option<PathBuf>,
}

impl CredentialStore {
    pub fn new(path: PathBuf, export_path: Option<PathBuf>) -> Self {
        Self { path, export_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<Credential>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        let credential = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(Some(credential))
    }

    pub fn save(&self, credential: &Credential) -> Result<()> {
        write_json_atomic(&self.path, credential)?;
        if let Some(export) = &self.export_path {
            write_json_atomic(export, &credential.cookies)
                .with_context(|| format!("exporting cookies to {}", export.display()))?;
        }
        Ok(())
    }
}

/// The credential in use for this run plus the store it is persisted to.
pub struct SessionContext {
    credential: Mutex<Credential>,
    store: CredentialStore,
}

impl SessionContext {
    pub fn new(credential: Credential, store: CredentialStore) -> Self {
        Self {
            credential: Mutex::new(credential),
            store,
        }
    }

    pub fn current(&self) -> Credential {
        self.credential.lock().clone()
    }

    /// Revalidates the session and, when the platform still accepts it,
    /// restamps the capture time so long runs do not expire a live credential.
    /// Returns `Ok(false)` without touching the credential on rejection.
    pub fn refresh(
        &self,
        validator: &dyn CredentialValidator,
        now: i64,
    ) -> Result<bool, HarvestError> {
        if !validator.validate(&self.current())? {
            return Ok(false);
        }
        let snapshot = {
            let mut credential = self.credential.lock();
            credential.captured_at = now;
            credential.clone()
        };
        if let Err(err) = self.store.save(&snapshot) {
            log::warn!("Could not persist refreshed credential: {err:#}");
        }
        Ok(true)
    }
}

/// Builds the session for a run. A supplied token replaces the stored one once
/// the platform accepts it; otherwise the stored credential must be present,
/// unexpired and valid.
pub fn establish_session(
    store: CredentialStore,
    validator: &dyn CredentialValidator,
    supplied_token: Option<&str>,
    now: i64,
) -> Result<SessionContext, HarvestError> {
    let credential = match supplied_token {
        Some(token) => Credential::from_token(token, now)?,
        None => {
            let stored = store
                .load()
                .map_err(|err| HarvestError::Credential(format!("{err:#}")))?
                .ok_or_else(|| {
                    HarvestError::Credential(format!(
                        "no credential at {}; run `harvest save-credential <token>`",
                        store.path().display()
                    ))
                })?;
            if stored.token().is_none() {
                return Err(HarvestError::Credential(
                    "stored credential has no session token".into(),
                ));
            }
            if stored.is_expired(now) {
                return Err(HarvestError::Credential(
                    "stored credential is older than seven days; save a fresh token".into(),
                ));
            }
            stored
        }
    };

    match validator.validate(&credential) {
        Ok(true) => {}
        Ok(false) => {
            return Err(HarvestError::Credential(
                "the platform rejected the session token".into(),
            ));
        }
        Err(err) => {
            return Err(HarvestError::Credential(format!(
                "could not validate session: {err}"
            )));
        }
    }

    if supplied_token.is_some() {
        store
            .save(&credential)
            .map_err(|err| HarvestError::Credential(format!("{err:#}")))?;
        log::info!("Saved session credential to {}", store.path().display());
    }
    Ok(SessionContext::new(credential, store))
}
