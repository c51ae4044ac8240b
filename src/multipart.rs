//! Streaming `multipart/form-data` decoding.  File parts are handed to the handler's
//! `handle_upload` as they arrive, other parts become `Post` parameters.

use alloc::string::String;
use alloc::vec::Vec;

use memchr::memmem;
use tracing::debug;

use crate::connection::Connection;
use crate::handler::Handler;
use crate::request::{ParamKind, Request, RequestError};

#[derive(Debug, PartialEq)]
enum State {
    Body,
    AfterDelimiter,
    Headers,
    Done,
}

struct Part {
    name: String,
    filename: Option<String>,
    content_type: String,
    value: Vec<u8>,
    index: usize,
}

pub(crate) struct MultipartParser {
    delimiter: Vec<u8>,
    finder: memmem::Finder<'static>,
    state: State,
    carry: Vec<u8>,
    part: Option<Part>,
    headers: Vec<u8>,
    max_header: usize,
    max_field: usize,
}

impl MultipartParser {
    pub(crate) fn new(boundary: &str, max_header: usize, max_field: usize) -> Self {
        let mut delimiter = Vec::with_capacity(boundary.len() + 4);
        delimiter.extend_from_slice(b"\r\n--");
        delimiter.extend_from_slice(boundary.as_bytes());

        Self {
            finder: memmem::Finder::new(&delimiter).into_owned(),
            delimiter,
            state: State::Body,
            // the first delimiter is not preceded by a line break
            carry: b"\r\n".to_vec(),
            part: None,
            headers: Vec::new(),
            max_header,
            max_field,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state == State::Done
    }

    pub(crate) fn feed<C, H>(
        &mut self,
        data: &[u8],
        req: &mut Request,
        handler: &mut H,
    ) -> Result<(), RequestError>
    where
        C: Connection,
        H: Handler<C> + ?Sized,
    {
        let joined;
        let input: &[u8] = if self.carry.is_empty() {
            data
        } else {
            let mut buf = core::mem::take(&mut self.carry);
            buf.extend_from_slice(data);
            joined = buf;
            &joined
        };

        let mut pos = 0;
        while pos < input.len() {
            let rest = &input[pos..];
            match self.state {
                State::Body => match self.finder.find(rest) {
                    Some(p) => {
                        self.emit::<C, H>(&rest[..p], true, req, handler);
                        pos += p + self.delimiter.len();
                        self.state = State::AfterDelimiter;
                    }
                    None => {
                        // the tail may be the start of a delimiter split across reads
                        let keep = rest.len().min(self.delimiter.len() - 1);
                        let safe = rest.len() - keep;
                        self.emit::<C, H>(&rest[..safe], false, req, handler);
                        self.carry.extend_from_slice(&rest[safe..]);
                        pos = input.len();
                    }
                },
                State::AfterDelimiter => {
                    if rest.len() < 2 {
                        self.carry.extend_from_slice(rest);
                        pos = input.len();
                        continue;
                    }
                    match &rest[..2] {
                        b"--" => {
                            self.state = State::Done;
                            pos = input.len();
                        }
                        b"\r\n" => {
                            self.state = State::Headers;
                            pos += 2;
                        }
                        _ => return Err(RequestError::MalformedMultipart),
                    }
                }
                State::Headers => {
                    let search_from = self.headers.len().saturating_sub(3);
                    let prev = self.headers.len();
                    self.headers.extend_from_slice(rest);
                    match memmem::find(&self.headers[search_from..], b"\r\n\r\n") {
                        Some(p) => {
                            let end = search_from + p + 4;
                            pos += end - prev;
                            self.headers.truncate(end);
                            self.begin_part();
                            self.state = State::Body;
                        }
                        None if self.headers.len() > self.max_header => {
                            return Err(RequestError::MalformedMultipart);
                        }
                        None => pos = input.len(),
                    }
                }
                // epilogue
                State::Done => pos = input.len(),
            }
        }

        Ok(())
    }

    fn begin_part(&mut self) {
        let headers = String::from_utf8_lossy(&self.headers).into_owned();
        self.headers.clear();

        let mut part = Part {
            name: String::new(),
            filename: None,
            content_type: String::from("text/plain"),
            value: Vec::new(),
            index: 0,
        };

        for line in headers.split("\r\n") {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();
            if name.eq_ignore_ascii_case("Content-Disposition") {
                for attr in value.split(';').skip(1) {
                    let Some((key, val)) = attr.trim().split_once('=') else {
                        continue;
                    };
                    let val = val.trim().trim_matches('"');
                    match key.trim() {
                        "name" => part.name = val.into(),
                        "filename" => part.filename = Some(val.into()),
                        _ => {}
                    }
                }
            } else if name.eq_ignore_ascii_case("Content-Type") {
                part.content_type = value.trim().into();
            }
        }

        debug!(
            name = part.name.as_str(),
            content_type = part.content_type.as_str(),
            file = part.filename.is_some(),
            "multipart part"
        );
        self.part = Some(part);
    }

    fn emit<C, H>(&mut self, data: &[u8], last: bool, req: &mut Request, handler: &mut H)
    where
        C: Connection,
        H: Handler<C> + ?Sized,
    {
        // preamble
        let Some(part) = self.part.as_mut() else {
            return;
        };

        match &part.filename {
            Some(filename) => {
                if !data.is_empty() || last {
                    handler.handle_upload(req, filename, part.index, data, last);
                }
                part.index += data.len();
            }
            None => {
                let room = self.max_field.saturating_sub(part.value.len());
                part.value
                    .extend_from_slice(&data[..data.len().min(room)]);
            }
        }

        if !last {
            return;
        }

        if let Some(part) = self.part.take() {
            match part.filename {
                Some(filename) => req.add_param(part.name, filename, ParamKind::File, part.index),
                None => {
                    let size = part.value.len();
                    let value = String::from_utf8_lossy(&part.value).into_owned();
                    req.add_param(part.name, value, ParamKind::Post, size);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::string::{String, ToString};
    use std::vec::Vec;

    use super::*;
    use crate::config::ServerConfig;
    use crate::connection::testing::TestConnection;
    use crate::request::{BodyParser, BodyProgress};
    use crate::response::Response;

    #[derive(Default)]
    struct Uploads {
        files: Vec<(String, usize, Vec<u8>, bool)>,
    }

    impl Handler<TestConnection> for Uploads {
        fn can_handle(&mut self, _req: &mut Request) -> bool {
            true
        }

        fn handle_request(&mut self, _req: &mut Request) -> Response<TestConnection> {
            Response::new(200)
        }

        fn handle_upload(
            &mut self,
            _req: &mut Request,
            filename: &str,
            index: usize,
            data: &[u8],
            last: bool,
        ) {
            self.files
                .push((filename.to_string(), index, data.to_vec(), last));
        }
    }

    const BODY: &str = "preamble\r\n--XyZ\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nhello world\r\n--XyZ\r\nContent-Disposition: form-data; name=\"data\"; filename=\"a.bin\"\r\nContent-Type: application/octet-stream\r\n\r\n0123456789\r\n--X\r\nend\r\n--XyZ--\r\nepilogue";

    fn run(step: usize) -> (Request, Uploads) {
        let head = std::format!(
            "POST /upload HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=XyZ\r\nContent-Length: {}\r\n\r\n",
            BODY.len()
        );
        let mut req = Request::from_head(&head);
        let config = ServerConfig::default();
        let mut parser = BodyParser::new(&req, &config).unwrap();
        let mut uploads = Uploads::default();

        let mut progress = BodyProgress::NeedMore;
        for piece in BODY.as_bytes().chunks(step) {
            progress = parser
                .feed::<TestConnection, _>(piece, &mut req, &mut uploads)
                .unwrap();
        }
        assert_eq!(progress, BodyProgress::Complete);
        (req, uploads)
    }

    #[test]
    fn test_multipart_fields_and_files() {
        for step in [1usize, 5, 16, 1024] {
            let (req, uploads) = run(step);

            assert_eq!(req.arg("title"), Some("hello world"), "step {}", step);

            let file = req.param("data", ParamKind::File).unwrap();
            assert_eq!(file.value, "a.bin");
            assert_eq!(file.size, 20);

            let mut content = Vec::new();
            let mut expected_index = 0;
            for (name, index, data, _) in &uploads.files {
                assert_eq!(name, "a.bin");
                assert_eq!(*index, expected_index, "step {}", step);
                expected_index += data.len();
                content.extend_from_slice(data);
            }
            assert_eq!(content, b"0123456789\r\n--X\r\nend");
            assert!(uploads.files.last().unwrap().3, "step {}", step);
            assert_eq!(uploads.files.iter().filter(|f| f.3).count(), 1);
        }
    }

    #[test]
    fn test_multipart_malformed_delimiter_line() {
        let mut req = Request::from_head(
            "POST / HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=b\r\nContent-Length: 10\r\n\r\n",
        );
        let mut parser = MultipartParser::new("b", 1024, 1024);
        let mut uploads = Uploads::default();
        assert_eq!(
            parser.feed::<TestConnection, _>(b"--bxx", &mut req, &mut uploads),
            Err(RequestError::MalformedMultipart)
        );
    }
}
