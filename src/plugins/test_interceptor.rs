//! A test-only plugin that lets tests observe requests mid-pipeline.
//!
//! Never loaded in production: its name appears only in the test registry
//! list, and no production configuration carries a section for it.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use axum::response::Response;

use crate::config::{ConfigError, Section};
use crate::plugin::{Plugin, PluginFactory, RequestInfo};

type RequestListener = dyn Fn(&Request<Body>) + Send + Sync;

pub struct TestInterceptorFactory {
    listener: Arc<RequestListener>,
}

impl TestInterceptorFactory {
    /// Builds a factory whose plugin invokes `listener` with every request
    /// it sees.
    pub fn with_listener(listener: impl Fn(&Request<Body>) + Send + Sync + 'static) -> Self {
        Self {
            listener: Arc::new(listener),
        }
    }
}

impl PluginFactory for TestInterceptorFactory {
    fn name(&self) -> &'static str {
        "test-interceptor"
    }

    fn new_plugin(&self, _section: &Section) -> Result<Option<Box<dyn Plugin>>, ConfigError> {
        Ok(Some(Box::new(TestInterceptorPlugin {
            listener: self.listener.clone(),
        })))
    }
}

struct TestInterceptorPlugin {
    listener: Arc<RequestListener>,
}

#[async_trait]
impl Plugin for TestInterceptorPlugin {
    fn name(&self) -> &'static str {
        "test-interceptor"
    }

    async fn handle_request(
        &self,
        request: &mut Request<Body>,
        _info: &RequestInfo,
    ) -> Option<Response> {
        (self.listener)(request);
        None
    }
}
