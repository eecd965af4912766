use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::registry::{ImageRegistry, RegistryError};
use crate::session::{Session, SessionError, ASSET_PATH};

/// Why a serve loop stopped.
#[derive(Debug, Error)]
pub enum DispatchEnd {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// What happened over the lifetime of one serve loop.
#[derive(Debug)]
pub struct DispatchSummary {
    pub served: u64,
    pub ignored: u64,
    pub end: DispatchEnd,
}

impl DispatchSummary {
    /// True when the loop ended because the display disconnected.
    pub fn peer_closed(&self) -> bool {
        matches!(&self.end, DispatchEnd::Session(err) if err.is_closed())
    }
}

/// Answers asset requests one at a time until the session ends. Requests for
/// any other path are read and dropped without a response.
pub async fn run<S>(session: &mut Session<S>, registry: &ImageRegistry) -> DispatchSummary
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut served = 0u64;
    let mut ignored = 0u64;

    info!(session_id = %session.session_id(), "serving slideshow requests");
    let end = loop {
        let request = match session.read_request().await {
            Ok(request) => request,
            Err(err) => break DispatchEnd::from(err),
        };

        if request.path() != ASSET_PATH {
            ignored += 1;
            debug!(method = %request.method, path = %request.target, "ignoring request");
            continue;
        }

        let image = match registry.fetch_with_retry().await {
            Ok(image) => image,
            Err(err) => break DispatchEnd::from(err),
        };
        if let Err(err) = session.write_asset_response(&image).await {
            break DispatchEnd::from(err);
        }
        served += 1;
    };

    match &end {
        DispatchEnd::Session(err) if err.is_closed() => {
            info!(served, ignored, "display closed the session")
        }
        other => warn!(served, ignored, error = %other, "serve loop stopped"),
    }

    DispatchSummary {
        served,
        ignored,
        end,
    }
}
