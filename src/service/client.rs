use crate::common::error::{RecognitionError, Result};
use crate::common::paths::{DEV_SOCKET_PATH, SYSTEM_SOCKET_PATH};
use crate::service::protocol::{
    read_raw_frame, write_frame, Envelope, Request, Response, StreamMessage, MSG_TYPE_RESPONSE,
    MSG_TYPE_STREAM,
};
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// Socket client for the recognition service, used by the CLI.
pub struct ServiceClient {
    socket_path: String,
    api_key: Option<String>,
}

impl ServiceClient {
    pub fn new(dev_mode: bool, api_key: Option<String>) -> Self {
        let socket_path = if dev_mode {
            DEV_SOCKET_PATH.to_string()
        } else {
            SYSTEM_SOCKET_PATH.to_string()
        };
        Self {
            socket_path,
            api_key,
        }
    }

    pub fn with_socket(socket_path: String, api_key: Option<String>) -> Self {
        Self {
            socket_path,
            api_key,
        }
    }

    /// Send one request and return the final response.
    pub fn call(&self, request: Request) -> Result<Response> {
        let mut stream = self.connect_with_retry(3)?;
        self.send(&mut stream, request)?;

        loop {
            let (msg_type, data) = read_raw_frame(&mut stream)?;
            if msg_type == MSG_TYPE_RESPONSE {
                return decode::<Response>(&data);
            }
            // Stream frames on a plain call are ignored.
        }
    }

    /// Start the JPEG stream and hand each frame to `on_frame` until it
    /// returns false or the server closes the connection.
    pub fn stream<F>(&self, mut on_frame: F) -> Result<()>
    where
        F: FnMut(StreamMessage) -> bool,
    {
        let mut stream = self.connect_with_retry(3)?;
        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        self.send(&mut stream, Request::Stream)?;

        loop {
            let (msg_type, data) = match read_raw_frame(&mut stream) {
                Ok(frame) => frame,
                // Server hung up; the stream is over.
                Err(RecognitionError::Io(_)) => return Ok(()),
                Err(e) => return Err(e),
            };

            match msg_type {
                MSG_TYPE_STREAM => {
                    if !on_frame(decode::<StreamMessage>(&data)?) {
                        return Ok(());
                    }
                }
                MSG_TYPE_RESPONSE => match decode::<Response>(&data)? {
                    Response::StreamStarting => continue,
                    Response::Error { message, .. } => {
                        return Err(RecognitionError::Other(anyhow::anyhow!(
                            "Stream refused: {}",
                            message
                        )));
                    }
                    _ => return Ok(()),
                },
                _ => continue,
            }
        }
    }

    fn send(&self, stream: &mut UnixStream, request: Request) -> Result<()> {
        let envelope = Envelope {
            api_key: self.api_key.clone(),
            request,
        };
        write_frame(stream, MSG_TYPE_RESPONSE, &envelope)
    }

    fn connect_with_retry(&self, max_retries: u32) -> Result<UnixStream> {
        for attempt in 0..max_retries {
            match UnixStream::connect(&self.socket_path) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(Duration::from_secs(120)))?;
                    stream.set_write_timeout(Some(Duration::from_secs(10)))?;
                    return Ok(stream);
                }
                Err(e) if attempt < max_retries - 1 => {
                    tracing::debug!("Connect attempt {} failed: {}", attempt + 1, e);
                    std::thread::sleep(Duration::from_millis(500));
                }
                Err(e) => {
                    return Err(RecognitionError::Other(anyhow::anyhow!(
                        "Failed to connect to service at {}: {}",
                        self.socket_path,
                        e
                    )));
                }
            }
        }
        unreachable!()
    }
}

fn decode<T: for<'de> serde::Deserialize<'de>>(data: &[u8]) -> Result<T> {
    bincode::deserialize(data)
        .map_err(|e| RecognitionError::Storage(format!("Failed to decode frame: {}", e)))
}
