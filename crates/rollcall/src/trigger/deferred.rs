//! Durable deferred-sync registration.
//!
//! A deferred request survives process exit: it is written to the local
//! store's metadata table and honoured by the next running trigger, either
//! at startup or when the process is signalled.

use chrono::{SecondsFormat, Utc};
use tracing::{debug, info};

use crate::error::Result;
use crate::storage::LocalStore;

const REGISTRATION_PREFIX: &str = "sync.registration.";
const REQUEST_PREFIX: &str = "sync.request.";

/// Registration and pending-request flag for one sync tag.
#[derive(Debug, Clone)]
pub struct DeferredSync {
    store: LocalStore,
    tag: String,
}

impl DeferredSync {
    /// Create a handle for `tag` backed by `store`.
    #[must_use]
    pub fn new(store: LocalStore, tag: impl Into<String>) -> Self {
        Self {
            store,
            tag: tag.into(),
        }
    }

    /// The sync tag.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    fn registration_key(&self) -> String {
        format!("{REGISTRATION_PREFIX}{}", self.tag)
    }

    fn request_key(&self) -> String {
        format!("{REQUEST_PREFIX}{}", self.tag)
    }

    /// Whether the tag has been registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be read.
    pub fn is_registered(&self) -> Result<bool> {
        Ok(self.store.get_meta(&self.registration_key())?.is_some())
    }

    /// Register the tag, recording when. Returns `false` if it already was.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be written.
    pub fn ensure_registered(&self) -> Result<bool> {
        if self.is_registered()? {
            return Ok(false);
        }
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        self.store.set_meta(&self.registration_key(), &now)?;
        info!(tag = %self.tag, "Registered deferred sync");
        Ok(true)
    }

    /// Ask for a sync at the next opportunity.
    ///
    /// Registers the tag if needed and returns the request token.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be written.
    pub fn request(&self) -> Result<String> {
        self.ensure_registered()?;
        let token = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);
        self.store.set_meta(&self.request_key(), &token)?;
        debug!(tag = %self.tag, %token, "Deferred sync requested");
        Ok(token)
    }

    /// The outstanding request token, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be read.
    pub fn pending_request(&self) -> Result<Option<String>> {
        self.store.get_meta(&self.request_key())
    }

    /// Whether a request is outstanding.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be read.
    pub fn is_requested(&self) -> Result<bool> {
        Ok(self.pending_request()?.is_some())
    }

    /// Clear the request identified by `token`.
    ///
    /// A newer request made since `token` was read is left in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be written.
    pub fn acknowledge(&self, token: &str) -> Result<bool> {
        self.store.delete_meta_if(&self.request_key(), token)
    }
}
