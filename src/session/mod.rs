//! Remote session engine
//!
//! TCP transport speaking the framed rview protocol. The handshake is
//! blocking; afterwards the socket is non-blocking and drained whenever the
//! reactor reports it readable, driving the pipeline's paint callbacks.

pub mod raster;

pub use raster::Raster;

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use rview_proto::{ClientMessage, FrameDecoder, FramedMessage, ServerMessage};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::pipeline::{
    DamageRect, PipelineError, Result, SessionEngine, SessionSettings, SourceFramebuffer, UpdateHandler,
};

/// Bytes read per `read` call
const READ_CHUNK: usize = 16 * 1024;

/// Reads per readiness notification; the rest waits for the next wait
const MAX_READS_PER_DISPATCH: usize = 64;

/// Transport and protocol failures
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server closed the connection")]
    Closed,

    #[error("not connected")]
    NotConnected,

    #[error("cannot resolve {0}")]
    Resolve(String),
}

impl From<SessionError> for PipelineError {
    fn from(err: SessionError) -> Self {
        PipelineError::Session(err.to_string())
    }
}

fn protocol(err: anyhow::Error) -> SessionError {
    SessionError::Protocol(err.to_string())
}

/// Where and how to reach the server
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub max_frame_bytes: usize,
}

/// TCP session engine
pub struct NetSession {
    options: SessionOptions,
    settings: SessionSettings,
    stream: Option<TcpStream>,
    decoder: FrameDecoder,
    outgoing: Vec<u8>,
    raster: Raster,
    disconnect: bool,
}

impl NetSession {
    pub fn new(options: SessionOptions, settings: SessionSettings) -> Self {
        let decoder = FrameDecoder::new(options.max_frame_bytes);
        Self {
            options,
            settings,
            stream: None,
            decoder,
            outgoing: Vec::new(),
            raster: Raster::empty(),
            disconnect: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn open_stream(&self) -> Result<TcpStream, SessionError> {
        let target = format!("{}:{}", self.options.host, self.options.port);
        let addrs = (self.options.host.as_str(), self.options.port)
            .to_socket_addrs()
            .map_err(|e| SessionError::Resolve(format!("{}: {}", target, e)))?;

        let mut last_err = None;
        for addr in addrs {
            debug!("Connecting to {}", addr);
            match TcpStream::connect_timeout(&addr, self.options.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Connection to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) => SessionError::Io(e),
            None => SessionError::Resolve(target),
        })
    }

    /// Send ClientInfo and wait for the server's Hello
    fn handshake(&self, stream: &mut TcpStream) -> Result<(u32, u32), SessionError> {
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(self.options.connect_timeout))?;
        stream.set_write_timeout(Some(self.options.connect_timeout))?;

        let info = ClientMessage::ClientInfo {
            width: self.settings.desktop_width,
            height: self.settings.desktop_height,
            fullscreen: self.settings.fullscreen,
        };
        stream.write_all(&FramedMessage::new(&info).map_err(protocol)?.encode())?;

        let reply = read_frame(stream, self.options.max_frame_bytes)?
            .decode_server_message()
            .map_err(protocol)?;
        let size = match reply {
            ServerMessage::Hello { width, height } => (width, height),
            ServerMessage::Disconnect { reason } => {
                return Err(SessionError::Protocol(format!("server refused session: {}", reason)))
            }
            other => return Err(SessionError::Protocol(format!("expected Hello, got {:?}", other))),
        };

        stream.set_read_timeout(None)?;
        stream.set_write_timeout(None)?;
        stream.set_nonblocking(true)?;
        Ok(size)
    }

    /// Read what the socket has; returns true on end of stream
    fn fill(&mut self) -> Result<bool, SessionError> {
        let stream = self.stream.as_mut().ok_or(SessionError::NotConnected)?;
        let mut chunk = [0u8; READ_CHUNK];

        for _ in 0..MAX_READS_PER_DISPATCH {
            match stream.read(&mut chunk) {
                Ok(0) => return Ok(true),
                Ok(n) => self.decoder.push(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    /// Apply every complete frame to the raster and the handler
    fn process(&mut self, handler: &mut dyn UpdateHandler) -> Result<()> {
        while !self.disconnect {
            let Some(frame) = self.decoder.next_frame().map_err(protocol)? else {
                break;
            };
            let message = frame.decode_server_message().map_err(protocol)?;
            trace!("Server message: {:?}", message);

            match message {
                ServerMessage::BeginPaint => handler.begin_paint(&mut self.raster)?,
                ServerMessage::Paint { x, y, width, height } => {
                    self.raster.paint(DamageRect::new(x, y, width, height), &frame.payload)?
                }
                ServerMessage::EndPaint => handler.end_paint(&mut self.raster)?,
                ServerMessage::DesktopResize { width, height } => {
                    info!("Remote desktop resized to {}x{}", width, height);
                    handler.desktop_resize(&mut self.raster, width, height)?;
                    self.settings.desktop_width = width;
                    self.settings.desktop_height = height;
                }
                ServerMessage::Disconnect { reason } => {
                    info!("Server ended the session: {}", reason);
                    self.disconnect = true;
                }
                ServerMessage::Hello { .. } => {
                    return Err(SessionError::Protocol("unexpected Hello after handshake".into()).into())
                }
            }
        }
        Ok(())
    }

    fn flush_outgoing(&mut self) -> Result<(), SessionError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        while !self.outgoing.is_empty() {
            match stream.write(&self.outgoing) {
                Ok(0) => return Err(SessionError::Closed),
                Ok(n) => {
                    self.outgoing.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl SessionEngine for NetSession {
    fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    fn settings_mut(&mut self) -> &mut SessionSettings {
        &mut self.settings
    }

    fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Err(PipelineError::InvalidState("session already connected"));
        }

        let mut stream = self.open_stream()?;
        let (width, height) = self.handshake(&mut stream)?;
        self.raster.resize(width, height)?;
        self.settings.desktop_width = width;
        self.settings.desktop_height = height;
        self.stream = Some(stream);
        self.disconnect = false;

        info!(
            "Connected to {}:{} ({}x{})",
            self.options.host, self.options.port, width, height
        );
        Ok(())
    }

    fn disconnect(&mut self) {
        self.disconnect = true;
        let Some(mut stream) = self.stream.take() else {
            return;
        };

        match FramedMessage::new(&ClientMessage::Disconnect) {
            Ok(frame) => self.outgoing.extend_from_slice(&frame.encode()),
            Err(e) => warn!("Failed to encode disconnect: {}", e),
        }
        let sent = stream
            .set_nonblocking(false)
            .and_then(|_| stream.set_write_timeout(Some(self.options.connect_timeout)))
            .and_then(|_| stream.write_all(&self.outgoing));
        if let Err(e) = sent {
            debug!("Failed to send disconnect: {}", e);
        }
        self.outgoing.clear();

        if let Err(e) = stream.shutdown(Shutdown::Both) {
            debug!("Socket shutdown failed: {}", e);
        }
        info!("Session closed");
    }

    fn event_handles(&self) -> Vec<RawFd> {
        self.stream.iter().map(|stream| stream.as_raw_fd()).collect()
    }

    fn check_handles(&mut self, handler: &mut dyn UpdateHandler) -> Result<()> {
        let eof = self.fill()?;
        self.process(handler)?;
        self.flush_outgoing()?;

        if eof && !self.disconnect {
            return Err(SessionError::Closed.into());
        }
        Ok(())
    }

    fn shall_disconnect(&self) -> bool {
        self.disconnect
    }

    fn request_disconnect(&mut self) {
        self.disconnect = true;
    }

    fn send_input(&mut self, message: ClientMessage) -> Result<()> {
        if self.stream.is_none() {
            return Err(SessionError::NotConnected.into());
        }
        let frame = FramedMessage::new(&message).map_err(protocol)?;
        if self.outgoing.len() + frame.encoded_len() > self.options.max_frame_bytes {
            return Err(SessionError::Protocol("outgoing input backlog is full".into()).into());
        }
        self.outgoing.extend_from_slice(&frame.encode());
        self.flush_outgoing()?;
        Ok(())
    }

    fn framebuffer(&self) -> &dyn SourceFramebuffer {
        &self.raster
    }

    fn framebuffer_mut(&mut self) -> &mut dyn SourceFramebuffer {
        &mut self.raster
    }
}

/// Blocking read of one whole frame
fn read_frame<R: Read>(reader: &mut R, max_frame_bytes: usize) -> Result<FramedMessage, SessionError> {
    let header = read_section(reader, max_frame_bytes)?;
    let payload = read_section(reader, max_frame_bytes.saturating_sub(header.len()))?;
    Ok(FramedMessage { header, payload })
}

fn read_section<R: Read>(reader: &mut R, limit: usize) -> Result<Vec<u8>, SessionError> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > limit {
        return Err(SessionError::Protocol(format!(
            "frame section of {} bytes exceeds limit {}",
            len, limit
        )));
    }
    let mut section = vec![0u8; len];
    reader.read_exact(&mut section)?;
    Ok(section)
}
