//! Shared harness for gateway integration tests.
#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use tether_core::auth::{Permission, Subject};
use tether_gateway::state::InProcess;
use tether_gateway::webhook::factory::FactoryConfig;

/// A gateway instance with its in-process backends exposed.
pub struct TestGateway {
    /// The composed router.
    pub app: Router,
    /// Backing state and fakes.
    pub ctx: InProcess,
}

/// Builds a gateway with default factory config.
pub fn gateway() -> TestGateway {
    let ctx = InProcess::build(FactoryConfig::default());
    let app = tether_gateway::app(ctx.state.clone());
    TestGateway { app, ctx }
}

impl TestGateway {
    /// Registers a bearer token with tenant grants.
    pub fn user(&self, token: &str, username: &str, grants: &[(&str, Permission)]) {
        self.ctx.register_token(
            token,
            Subject {
                username: username.to_string(),
                groups: vec![],
                uid: format!("uid-{username}"),
            },
        );
        for (tenant, permission) in grants {
            self.ctx
                .static_authorizer
                .grant_user(username, tenant, *permission);
        }
    }

    /// Sends a request and returns status plus parsed JSON body (or
    /// `Value::Null` for empty/non-JSON bodies).
    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        headers: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(bytes) => builder
                .header("content-type", "application/json")
                .body(Body::from(bytes))
                .expect("request build"),
            None => builder.body(Body::empty()).expect("request build"),
        };

        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("infallible router");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body read");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    /// Sends a request and returns status plus the raw body text.
    pub async fn request_text(
        &self,
        method: &str,
        uri: &str,
        headers: &[(&str, &str)],
    ) -> (StatusCode, String) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let response = self
            .app
            .clone()
            .oneshot(builder.body(Body::empty()).expect("request build"))
            .await
            .expect("infallible router");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body read");
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }
}
