//! Access token sources.
//!
//! The outbox never acquires tokens itself. It asks a [`TokenProvider`] right
//! before each request; `None` means "not signed in".

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_token(&self) -> Option<String>;
}

#[async_trait]
impl<T: TokenProvider + ?Sized> TokenProvider for Arc<T> {
    async fn get_token(&self) -> Option<String> {
        (**self).get_token().await
    }
}

/// A fixed token (or none), e.g. from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl From<Option<String>> for StaticToken {
    fn from(token: Option<String>) -> Self {
        Self(token)
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn get_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Token slot updated by the host app when the user signs in or out.
///
/// Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct SharedToken {
    slot: Arc<RwLock<Option<String>>>,
}

impl SharedToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    pub fn clear(&self) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

#[async_trait]
impl TokenProvider for SharedToken {
    async fn get_token(&self) -> Option<String> {
        self.slot.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
