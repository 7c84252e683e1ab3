use thiserror::Error;

const MAX_HEADERS: usize = 64;
const MAX_HEAD_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed response head: {0}")]
    Head(#[from] httparse::Error),
    #[error("response head larger than 64KiB")]
    HeadTooLarge,
    #[error("invalid content-length '{0}'")]
    ContentLength(String),
    #[error("invalid chunk size")]
    ChunkSize,
    #[error("missing CRLF after chunk data")]
    ChunkTerminator,
}

#[derive(Debug)]
pub enum ParseEvent {
    Headers {
        status: u16,
        headers: Vec<(String, String)>,
    },
    Complete {
        status: u16,
        /// Wire size of the whole response, head included.
        bytes: usize,
        body: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Head,
    Bodiless,
    Fixed { remaining: usize },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkEnd,
    Trailers,
    UntilClose,
}

#[derive(Debug)]
struct Message {
    status: u16,
    bytes: usize,
    body: Vec<u8>,
}

struct Head {
    len: usize,
    status: u16,
    headers: Vec<(String, String)>,
    content_length: Option<usize>,
    chunked: bool,
}

/// Incremental HTTP/1.1 response parser. Bytes go in through `feed`; `poll`
/// yields the head and then the completion of each response in order.
pub struct ResponseParser {
    buf: Vec<u8>,
    state: State,
    message: Option<Message>,
    capture_body: bool,
}

impl ResponseParser {
    pub fn new(capture_body: bool) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            state: State::Head,
            message: None,
            capture_body,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// `head_request` tells the parser the pending response answers a HEAD
    /// request and carries no body whatever its headers say.
    pub fn poll(&mut self, head_request: bool) -> Result<Option<ParseEvent>, ParseError> {
        loop {
            match self.state {
                State::Head => {
                    let Some(head) = parse_head(&self.buf)? else {
                        if self.buf.len() > MAX_HEAD_SIZE {
                            return Err(ParseError::HeadTooLarge);
                        }
                        return Ok(None);
                    };
                    self.buf.drain(..head.len);

                    // interim responses precede the real one
                    if (100..200).contains(&head.status) && head.status != 101 {
                        continue;
                    }

                    self.state = if head_request
                        || head.status == 101
                        || head.status == 204
                        || head.status == 304
                    {
                        State::Bodiless
                    } else if head.chunked {
                        State::ChunkSize
                    } else if let Some(length) = head.content_length {
                        State::Fixed { remaining: length }
                    } else {
                        State::UntilClose
                    };
                    self.message = Some(Message {
                        status: head.status,
                        bytes: head.len,
                        body: Vec::new(),
                    });
                    return Ok(Some(ParseEvent::Headers {
                        status: head.status,
                        headers: head.headers,
                    }));
                }
                State::Bodiless | State::Fixed { remaining: 0 } => return Ok(Some(self.complete())),
                State::Fixed { remaining } => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(self.buf.len());
                    self.consume(take, true);
                    self.state = State::Fixed {
                        remaining: remaining - take,
                    };
                }
                State::ChunkSize => match httparse::parse_chunk_size(&self.buf) {
                    Ok(httparse::Status::Complete((len, size))) => {
                        self.consume(len, false);
                        self.state = if size == 0 {
                            State::Trailers
                        } else {
                            State::ChunkData { remaining: size }
                        };
                    }
                    Ok(httparse::Status::Partial) => return Ok(None),
                    Err(_) => return Err(ParseError::ChunkSize),
                },
                State::ChunkData { remaining } => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(self.buf.len() as u64) as usize;
                    self.consume(take, true);
                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        State::ChunkEnd
                    } else {
                        State::ChunkData { remaining }
                    };
                }
                State::ChunkEnd => {
                    if self.buf.len() < 2 {
                        return Ok(None);
                    }
                    if &self.buf[..2] != b"\r\n" {
                        return Err(ParseError::ChunkTerminator);
                    }
                    self.consume(2, false);
                    self.state = State::ChunkSize;
                }
                State::Trailers => {
                    let Some(end) = self.buf.windows(2).position(|w| w == b"\r\n") else {
                        return Ok(None);
                    };
                    self.consume(end + 2, false);
                    if end == 0 {
                        return Ok(Some(self.complete()));
                    }
                }
                State::UntilClose => {
                    let len = self.buf.len();
                    self.consume(len, true);
                    return Ok(None);
                }
            }
        }
    }

    /// Called when the peer closes. Completes a response whose body is
    /// delimited by the close.
    pub fn finish(&mut self) -> Option<ParseEvent> {
        if self.state == State::UntilClose {
            Some(self.complete())
        } else {
            None
        }
    }

    fn consume(&mut self, n: usize, body: bool) {
        if let Some(message) = self.message.as_mut() {
            message.bytes += n;
            if body && self.capture_body {
                message.body.extend_from_slice(&self.buf[..n]);
            }
        }
        self.buf.drain(..n);
    }

    fn complete(&mut self) -> ParseEvent {
        self.state = State::Head;
        let message = self.message.take().unwrap_or(Message {
            status: 0,
            bytes: 0,
            body: Vec::new(),
        });
        ParseEvent::Complete {
            status: message.status,
            bytes: message.bytes,
            body: self.capture_body.then_some(message.body),
        }
    }
}

fn parse_head(buf: &[u8]) -> Result<Option<Head>, ParseError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let len = match response.parse(buf)? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    let mut content_length = None;
    let mut chunked = false;
    let mut owned = Vec::with_capacity(response.headers.len());
    for header in response.headers.iter() {
        let value = String::from_utf8_lossy(header.value).into_owned();
        if header.name.eq_ignore_ascii_case("content-length") {
            let parsed = value
                .trim()
                .parse::<usize>()
                .map_err(|_| ParseError::ContentLength(value.clone()))?;
            content_length = Some(parsed);
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = value
                .rsplit(',')
                .next()
                .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        }
        owned.push((header.name.to_string(), value));
    }

    Ok(Some(Head {
        len,
        status: response.code.unwrap_or(0),
        headers: owned,
        content_length,
        chunked,
    }))
}
