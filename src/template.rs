//! `%NAME%` placeholder substitution over streamed content.
//!
//! Source bytes are pulled into a lookahead buffer and only released once every placeholder
//! they may start has been resolved, so the output does not depend on how the source splits
//! its content across fills.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec;

use crate::config::{TEMPLATE_PARAM_NAME_LENGTH, TEMPLATE_PLACEHOLDER};
use crate::content::{ContentSource, Fill};

/// Substitutes placeholders using a callback that maps a name to its value.  `%%` produces a
/// literal `%`, and a `%` without a closing delimiter within the name length is left as is.
///
/// ```
/// use asyncweb::template::TemplateProcessor;
///
/// let mut processor = TemplateProcessor::new(|name: &str| match name {
///     "USER" => "admin".into(),
///     _ => "".into(),
/// });
/// assert_eq!(processor.process_str("Hello %USER%, 100%%!"), "Hello admin, 100%!");
/// ```
pub struct TemplateProcessor {
    callback: Box<dyn FnMut(&str) -> String>,
    raw: VecDeque<u8>,
    out: VecDeque<u8>,
    eof: bool,
}

impl TemplateProcessor {
    #[allow(missing_docs)]
    pub fn new<F>(callback: F) -> Self
    where
        F: FnMut(&str) -> String + 'static,
    {
        Self {
            callback: Box::new(callback),
            raw: VecDeque::new(),
            out: VecDeque::new(),
            eof: false,
        }
    }

    /// Process a complete document in one pass.
    pub fn process_str(&mut self, input: &str) -> String {
        self.raw.extend(input.as_bytes());
        self.eof = true;
        self.process();
        let out: alloc::vec::Vec<u8> = self.out.drain(..).collect();
        String::from_utf8_lossy(&out).into_owned()
    }

    /// Fill `buf` with substituted content pulled from `source`.
    pub(crate) fn fill(&mut self, source: &mut dyn ContentSource, buf: &mut [u8]) -> Fill {
        while self.out.len() < buf.len() {
            self.process();
            if self.out.len() >= buf.len() || self.eof {
                break;
            }

            let mut chunk = vec![0u8; buf.len()];
            match source.fill(&mut chunk) {
                Fill::TryAgain if self.out.is_empty() => return Fill::TryAgain,
                Fill::TryAgain => break,
                Fill::Ready(0) => self.eof = true,
                Fill::Ready(n) => self.raw.extend(&chunk[..n]),
            }
        }

        let n = self.out.len().min(buf.len());
        for (dst, src) in buf.iter_mut().zip(self.out.drain(..n)) {
            *dst = src;
        }
        Fill::Ready(n)
    }

    /// Move every byte whose meaning is settled from `raw` to `out`.
    fn process(&mut self) {
        while let Some(&first) = self.raw.front() {
            if first != TEMPLATE_PLACEHOLDER {
                let end = self
                    .raw
                    .iter()
                    .position(|b| *b == TEMPLATE_PLACEHOLDER)
                    .unwrap_or(self.raw.len());
                self.out.extend(self.raw.drain(..end));
                continue;
            }

            let window = self.raw.len().min(TEMPLATE_PARAM_NAME_LENGTH + 2);
            let close = self
                .raw
                .range(1..window)
                .position(|b| *b == TEMPLATE_PLACEHOLDER)
                .map(|p| p + 1);

            match close {
                Some(1) => {
                    self.out.push_back(TEMPLATE_PLACEHOLDER);
                    self.raw.drain(..2);
                }
                Some(end) => {
                    let name: alloc::vec::Vec<u8> = self.raw.range(1..end).copied().collect();
                    let name = String::from_utf8_lossy(&name);
                    let value = (self.callback)(&name);
                    self.out.extend(value.as_bytes());
                    self.raw.drain(..=end);
                }
                None if self.eof || self.raw.len() > TEMPLATE_PARAM_NAME_LENGTH + 1 => {
                    self.out.push_back(TEMPLATE_PLACEHOLDER);
                    self.raw.pop_front();
                }
                // wait for more source bytes
                None => return,
            }
        }
    }
}
