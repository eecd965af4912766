use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::info;

use crate::config::Config;
use crate::discovery::{DiscoveryError, DnsSdBackend, Endpoint, Resolver};
use crate::dispatch::{self, DispatchSummary};
use crate::registry::ImageRegistry;
use crate::session::{Session, SessionError};

#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("failed to read selection: {0}")]
    Io(#[from] io::Error),
    #[error("selection {0:?} is not a device number")]
    InvalidInput(String),
    #[error("selection {index} is out of range, {count} device(s) found")]
    OutOfRange { index: usize, count: usize },
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("no image sources configured")]
    NoImageSources,
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("device selection failed: {0}")]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Chooses which discovered endpoint to connect to. `endpoints` is never empty.
#[async_trait]
pub trait EndpointPicker: Send + Sync {
    async fn pick(&self, endpoints: &[Endpoint]) -> Result<usize, SelectionError>;
}

/// Always answers the same index; used for `--device`.
#[derive(Debug, Clone, Copy)]
pub struct FixedPicker(pub usize);

#[async_trait]
impl EndpointPicker for FixedPicker {
    async fn pick(&self, endpoints: &[Endpoint]) -> Result<usize, SelectionError> {
        check_range(self.0, endpoints.len())
    }
}

/// Prints the numbered endpoint list on stdout and reads one line from stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPicker;

#[async_trait]
impl EndpointPicker for StdinPicker {
    async fn pick(&self, endpoints: &[Endpoint]) -> Result<usize, SelectionError> {
        let mut input = BufReader::new(tokio::io::stdin());
        let mut output = tokio::io::stdout();
        prompt(&mut input, &mut output, endpoints).await
    }
}

/// The picker the configuration asks for: a fixed index when one was given,
/// otherwise the stdin prompt.
#[derive(Debug, Clone, Copy)]
pub enum DevicePicker {
    Fixed(FixedPicker),
    Prompt(StdinPicker),
}

impl DevicePicker {
    /// Fails on a pre-selected device that is not an index, so the run stops
    /// before discovery instead of falling back to the prompt.
    pub fn from_config(config: &Config) -> Result<Self, RunError> {
        match config.device.as_deref() {
            Some(raw) => {
                let index = raw
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| SelectionError::InvalidInput(raw.to_string()))?;
                Ok(Self::Fixed(FixedPicker(index)))
            }
            None => Ok(Self::Prompt(StdinPicker)),
        }
    }
}

#[async_trait]
impl EndpointPicker for DevicePicker {
    async fn pick(&self, endpoints: &[Endpoint]) -> Result<usize, SelectionError> {
        match self {
            Self::Fixed(picker) => picker.pick(endpoints).await,
            Self::Prompt(picker) => picker.pick(endpoints).await,
        }
    }
}

pub fn render_menu(endpoints: &[Endpoint]) -> String {
    endpoints
        .iter()
        .enumerate()
        .map(|(index, endpoint)| format!("{index}) {endpoint}\n"))
        .collect()
}

pub fn parse_selection(line: &str, count: usize) -> Result<usize, SelectionError> {
    let trimmed = line.trim();
    let index = trimmed
        .parse::<usize>()
        .map_err(|_| SelectionError::InvalidInput(trimmed.to_string()))?;
    check_range(index, count)
}

fn check_range(index: usize, count: usize) -> Result<usize, SelectionError> {
    if index < count {
        Ok(index)
    } else {
        Err(SelectionError::OutOfRange { index, count })
    }
}

pub async fn prompt<R, W>(
    input: &mut R,
    output: &mut W,
    endpoints: &[Endpoint],
) -> Result<usize, SelectionError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    output.write_all(render_menu(endpoints).as_bytes()).await?;
    output.flush().await?;

    let mut line = String::new();
    if input.read_line(&mut line).await? == 0 {
        return Err(SelectionError::InvalidInput(String::new()));
    }
    parse_selection(&line, endpoints.len())
}

pub struct Orchestrator<B, P> {
    resolver: Resolver<B>,
    picker: P,
    registry: Arc<ImageRegistry>,
    config: Config,
}

impl<B, P> Orchestrator<B, P>
where
    B: DnsSdBackend,
    P: EndpointPicker,
{
    pub fn new(resolver: Resolver<B>, picker: P, registry: Arc<ImageRegistry>, config: Config) -> Self {
        Self {
            resolver,
            picker,
            registry,
            config,
        }
    }

    /// Runs one session to completion. Setup failures are returned; once
    /// serving has started, the way the session ended is part of the summary.
    pub async fn run(&self) -> Result<DispatchSummary, RunError> {
        if self.registry.is_empty() {
            return Err(RunError::NoImageSources);
        }

        let endpoints = self
            .resolver
            .discover(&self.config.service_type, self.config.discovery_window)
            .await?;
        let index = self.picker.pick(&endpoints).await?;
        let endpoint = endpoints
            .get(index)
            .copied()
            .ok_or(SelectionError::OutOfRange {
                index,
                count: endpoints.len(),
            })?;
        info!(%endpoint, index, "display selected");

        let mut session = Session::connect(&endpoint).await?;
        session.handshake().await?;
        session.subscribe(&self.config.slideshow).await?;

        let background = self.registry.run_all();
        let summary = dispatch::run(&mut session, &self.registry).await;
        for task in background {
            task.abort();
        }

        info!(
            %endpoint,
            session_id = %session.session_id(),
            served = summary.served,
            ignored = summary.ignored,
            "session ended"
        );
        Ok(summary)
    }
}
