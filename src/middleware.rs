//! Scope gate for protected resource routes

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tracing::debug;

use crate::auth::{BearerValidator, TokenIdentity};
use crate::error::AccessError;
use crate::scope::ScopeSet;

/// Rejects requests whose bearer token lacks any of the required scopes
#[derive(Debug, Clone)]
pub struct ScopeGate {
    validator: BearerValidator,
    required: ScopeSet,
}

impl ScopeGate {
    pub(crate) fn new(validator: BearerValidator, required: ScopeSet) -> Self {
        Self { validator, required }
    }

    /// Scopes this gate demands
    #[must_use]
    pub fn required(&self) -> &ScopeSet {
        &self.required
    }

    /// Framework-neutral check of an `Authorization` header value
    pub async fn check(&self, authorization: Option<&str>) -> Result<TokenIdentity, AccessError> {
        self.validator
            .validate(authorization, &self.required)
            .await
            .map(TokenIdentity::from)
    }

    /// Guard every route already added to `router`.
    ///
    /// Successful requests carry a [`TokenIdentity`] extension. Routes added
    /// after this call are not guarded.
    pub fn protect<S>(self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        router.route_layer(from_fn_with_state(self, enforce))
    }
}

async fn enforce(State(gate): State<ScopeGate>, mut request: Request, next: Next) -> Response {
    let authorization = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    match gate.check(authorization.as_deref()).await {
        Ok(identity) => {
            request.extensions_mut().insert(identity);
            next.run(request).await
        }
        Err(err) => {
            debug!(code = err.code(), path = %request.uri().path(), "Protected resource request rejected");
            err.into_response()
        }
    }
}
