//! One reverse (PTTH) connection to a display.
//!
//! The session opens a TCP stream, upgrades it with `POST /reverse`, subscribes
//! to the slideshow with `PUT /slideshows/1` and from then on answers the
//! requests the display sends back over the same stream. Every step checks the
//! current [`SessionState`] first and fails with [`SessionError::InvalidState`]
//! rather than writing out of order.

pub mod http;

use std::fmt;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::discovery::Endpoint;
use crate::document::{self, DocumentError, DocumentForm, SlideshowSettings};
use http::{FramingError, InboundRequest, OutboundMessage};

pub const REVERSE_PATH: &str = "/reverse";
pub const SLIDESHOW_PATH: &str = "/slideshows/1";
pub const ASSET_PATH: &str = "/slideshows/1/assets/1";
const SESSION_HEADER: &str = "X-Apple-Session-ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connected,
    Upgraded,
    Subscribed,
    Serving,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Idle => "idle",
            SessionState::Connected => "connected",
            SessionState::Upgraded => "upgraded",
            SessionState::Subscribed => "subscribed",
            SessionState::Serving => "serving",
            SessionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("slideshow subscription failed: {0}")]
    Subscribe(String),
    #[error("stream error: {0}")]
    Stream(#[from] FramingError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("{operation} is not valid while the session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
}

impl SessionError {
    /// True when the peer went away rather than misbehaving.
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionError::Stream(FramingError::Closed))
    }
}

pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

pub struct Session<S = TcpStream> {
    stream: BufReader<S>,
    session_id: String,
    state: SessionState,
}

impl Session<TcpStream> {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, SessionError> {
        let stream = TcpStream::connect(endpoint.socket_addr())
            .await
            .map_err(|source| SessionError::Connect {
                endpoint: *endpoint,
                source,
            })?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(error = %err, "failed to set TCP_NODELAY");
        }
        info!(%endpoint, "connected to display");
        Ok(Self::from_stream(stream))
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an already-open stream; the session starts out `Connected`.
    pub fn from_stream(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            session_id: generate_session_id(),
            state: SessionState::Connected,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn expect_state(
        &self,
        operation: &'static str,
        allowed: &[SessionState],
    ) -> Result<(), SessionError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// `POST /reverse` with the PTTH upgrade headers. The display must answer
    /// with `Connection: Upgrade`; afterwards it is the display that sends
    /// requests. A refused upgrade leaves the session `Connected`.
    pub async fn handshake(&mut self) -> Result<(), SessionError> {
        self.expect_state("handshake", &[SessionState::Connected])?;

        let request = OutboundMessage::request("POST", REVERSE_PATH)
            .header("Upgrade", "PTTH/1.0")
            .header("X-Apple-Purpose", "slideshow")
            .header("Content-Length", 0)
            .header(SESSION_HEADER, &self.session_id)
            .header("Connection", "Upgrade");
        http::write_message(self.stream.get_mut(), &request)
            .await
            .map_err(|err| self.fail(err))?;

        let response = http::read_response(&mut self.stream)
            .await
            .map_err(|err| self.fail(err))?;
        let upgraded = response
            .headers
            .get("Connection")
            .is_some_and(|value| value.eq_ignore_ascii_case("Upgrade"));
        if !upgraded {
            return Err(SessionError::Handshake(format!(
                "display answered {} {} without Connection: Upgrade",
                response.status, response.reason
            )));
        }

        self.state = SessionState::Upgraded;
        info!(session_id = %self.session_id, status = response.status, "reverse connection upgraded");
        Ok(())
    }

    /// `PUT /slideshows/1` with the playing state and display settings as an
    /// XML plist. Any failure closes the session.
    pub async fn subscribe(&mut self, settings: &SlideshowSettings) -> Result<(), SessionError> {
        self.expect_state("subscribe", &[SessionState::Upgraded])?;

        let body = match document::encode(&document::subscribe_document(settings), DocumentForm::Xml)
        {
            Ok(body) => body,
            Err(err) => {
                self.state = SessionState::Closed;
                return Err(err.into());
            }
        };
        let request = OutboundMessage::request("PUT", SLIDESHOW_PATH)
            .header("Content-Type", DocumentForm::Xml.content_type())
            .header(SESSION_HEADER, &self.session_id)
            .body(body);
        http::write_message(self.stream.get_mut(), &request)
            .await
            .map_err(|err| self.fail(err))?;

        let response = http::read_response(&mut self.stream)
            .await
            .map_err(|err| self.fail(err))?;
        if !response.is_success() {
            self.state = SessionState::Closed;
            return Err(SessionError::Subscribe(format!(
                "display answered {} {}",
                response.status, response.reason
            )));
        }

        self.state = SessionState::Subscribed;
        info!(
            session_id = %self.session_id,
            slide_duration = settings.slide_duration,
            theme = %settings.theme,
            "slideshow subscribed"
        );
        Ok(())
    }

    /// Next request from the display. The first call moves the session into
    /// `Serving`; any error closes it.
    pub async fn read_request(&mut self) -> Result<InboundRequest, SessionError> {
        self.expect_state(
            "read_request",
            &[SessionState::Subscribed, SessionState::Serving],
        )?;
        self.state = SessionState::Serving;

        let request = http::read_request(&mut self.stream)
            .await
            .map_err(|err| self.fail(err))?;
        debug!(
            session_id = %self.session_id,
            method = %request.method,
            path = %request.target,
            body_len = request.body.len(),
            "request from display"
        );
        Ok(request)
    }

    /// `200 OK` carrying `{data, info: {key: 1, id: 1}}` as a binary plist.
    /// The whole response is serialised first and written in one call.
    pub async fn write_asset_response(&mut self, image: &[u8]) -> Result<(), SessionError> {
        self.expect_state("write_asset_response", &[SessionState::Serving])?;

        let body = document::encode(&document::asset_document(image), DocumentForm::Binary)?;
        let response = OutboundMessage::response(200, "OK")
            .header("Content-Type", DocumentForm::Binary.content_type())
            .body(body);
        http::write_message(self.stream.get_mut(), &response)
            .await
            .map_err(|err| self.fail(err))?;
        debug!(session_id = %self.session_id, image_len = image.len(), "asset sent");
        Ok(())
    }

    fn fail(&mut self, err: FramingError) -> SessionError {
        if !matches!(err, FramingError::Closed) {
            warn!(session_id = %self.session_id, state = %self.state, error = %err, "session stream failed");
        }
        self.state = SessionState::Closed;
        SessionError::Stream(err)
    }
}
