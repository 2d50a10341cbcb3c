#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use herald_core::app::{App, AppBuilder};
use herald_core::config::HeraldConfig;
use herald_core::ports::{Clock, DeliveryInfo, FixedClock, MailTransport, TransportError};
use tokio::time::Instant;

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

/// One recorded `send` call.
#[derive(Debug, Clone)]
pub struct SendCall {
    pub to: String,
    pub subject: String,
    pub at: Instant,
}

/// Transport double: succeeds unless told to fail, records every call.
#[derive(Default)]
pub struct ScriptedTransport {
    always_fail: bool,
    calls: Mutex<Vec<SendCall>>,
}

impl ScriptedTransport {
    pub fn accepting() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            always_fail: true,
            calls: Mutex::default(),
        }
    }

    pub fn calls(&self) -> Vec<SendCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for ScriptedTransport {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        _html_body: &str,
    ) -> Result<DeliveryInfo, TransportError> {
        self.calls.lock().unwrap().push(SendCall {
            to: to.to_string(),
            subject: subject.to_string(),
            at: Instant::now(),
        });
        if self.always_fail {
            return Err(TransportError::Unavailable("connection refused".to_string()));
        }
        Ok(DeliveryInfo {
            message_id: format!("<{subject}@test>"),
            accepted: vec![to.to_string()],
        })
    }
}

/// App over in-memory adapters with a settable clock.
pub async fn app_with(
    transport: Arc<ScriptedTransport>,
    clock: Arc<FixedClock>,
    config: HeraldConfig,
) -> App {
    AppBuilder::new(config)
        .transport(transport)
        .clock(clock as Arc<dyn Clock>)
        .build()
        .await
        .unwrap()
}
