//! HTTP backend: a single long-running GET on
//! `/api/services/{MirakurunServiceId}/stream` whose response body is raw
//! MPEG-TS.

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::io::StreamReader;
use tracing::debug;

use super::{Backend, OpenOutcome, TsReader};
use crate::error::{CoreError, CoreResult};
use crate::model::ChannelCoordinates;

#[derive(Clone)]
pub struct HttpAdapter {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAdapter {
    pub fn new(base_url: String, client: reqwest::Client) -> Self {
        Self { base_url, client }
    }

    pub(super) async fn try_open(
        &self,
        coordinates: ChannelCoordinates,
    ) -> CoreResult<OpenOutcome> {
        let service_id = coordinates.mirakurun_service_id();
        let url = format!(
            "{}/api/services/{}/stream",
            self.base_url.trim_end_matches('/'),
            service_id
        );
        debug!(%url, "opening HTTP tuner stream");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::BackendUnreachable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(CoreError::ChannelNotFound(format!("service {service_id}")));
        }
        if response.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(CoreError::NoTunerAvailable);
        }
        if !response.status().is_success() {
            return Err(CoreError::BackendUnreachable(format!(
                "unexpected status {}",
                response.status()
            )));
        }

        let byte_stream = response
            .bytes_stream()
            .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
        let reader: TsReader = Box::new(StreamReader::new(byte_stream));

        let session = HttpSession {
            cancelled: Mutex::new(false),
        };
        Ok((Backend::Http(session), reader, service_id as u32))
    }
}

pub struct HttpSession {
    cancelled: Mutex<bool>,
}

impl HttpSession {
    pub async fn disconnect_stream(&self) {
        // Dropping the reqwest response body tears the connection down;
        // the Ingest loop drops its reader on hand-off, which is enough.
        *self.cancelled.lock().await = true;
    }

    pub async fn close(&self) {
        *self.cancelled.lock().await = true;
    }
}

/// A session with no live connection behind it, for `registry` tests that
/// need a `TunerHandle` without opening a real backend.
#[cfg(test)]
pub(crate) fn test_session() -> HttpSession {
    HttpSession {
        cancelled: Mutex::new(false),
    }
}
