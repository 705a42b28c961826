// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bearer token used to authenticate push requests.

use std::fmt::Debug;
use std::sync::Arc;
use std::{future::Future, pin::Pin};
use tokio::sync::OnceCell;

pub type TokenResolverFn =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Option<String>> + Send>> + Send + Sync>;

/// Source of the bearer token sent with every push request.
///
/// A dynamic provider runs its resolver once, on the first delivery, so
/// secrets can be fetched lazily without delaying session start.
#[derive(Clone)]
pub enum CredentialProvider {
    /// Requests carry no `Authorization` header.
    Anonymous,
    Static(String),
    Dynamic {
        resolver_fn: TokenResolverFn,
        token: Arc<OnceCell<Option<String>>>,
    },
}

impl CredentialProvider {
    pub fn new_from_resolver(resolver_fn: TokenResolverFn) -> Self {
        Self::Dynamic {
            resolver_fn,
            token: Arc::new(OnceCell::new()),
        }
    }

    #[must_use]
    pub fn from_option(token: Option<&str>) -> Self {
        match token {
            Some(token) if !token.is_empty() => Self::Static(token.to_string()),
            _ => Self::Anonymous,
        }
    }

    pub async fn get_token(&self) -> Option<&str> {
        match self {
            Self::Anonymous => None,
            Self::Static(token) => Some(token),
            Self::Dynamic { resolver_fn, token } => token
                .get_or_init(|| async { (resolver_fn)().await })
                .await
                .as_deref(),
        }
    }
}

impl Debug for CredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CredentialProvider")
    }
}
