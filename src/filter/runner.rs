// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Filter execution backends: isolated child processes, and an in-process
//! seam for tests.

use super::{proto, FilterSpec};
use crate::{AttrOrigin, Error, Object, Result};
use std::io::{BufReader, BufWriter, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{Duration, Instant};

/// How long a filter child may take to exit after the `end` record before it
/// is killed.
const CHILD_REAP_GRACE: Duration = Duration::from_secs(2);

/// Something that can evaluate one filter against objects.
///
/// The production implementation is [`ChildFilter`], which keeps the
/// untrusted filter code in an isolated child process for the lifetime of a
/// search. [`FnFilter`] exists so the executor and the search pipeline can be
/// exercised in-process.
pub trait FilterRunner: Send {
    /// Evaluates the filter against one object.
    ///
    /// The filter may write new attributes onto the object. The returned
    /// integer decides the object's fate: 0 drops it, anything else keeps it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FilterProtocol`] if the filter misbehaves; the owning
    /// search is aborted.
    fn eval(&mut self, obj: &mut Object) -> Result<i64>;

    /// Ends the conversation and releases the filter's resources.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if an orderly shutdown was impossible.
    fn shutdown(self: Box<Self>) -> Result<()>;
}

/// A filter running in an isolated child process, spoken to over the
/// [`proto`] framing on its stdio.
///
/// Conversation: one configuration preamble at spawn (name, arguments,
/// threshold, blob argument), then one exchange per object. Per object the
/// parent sends the payload blob, the names of the provided attributes, and
/// one blob per provided attribute; the child replies with any number of
/// attribute writes (`str` name followed by `blob` value) and finally an
/// `int` verdict.
pub struct ChildFilter {
    name: String,
    reads: Vec<String>,
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl ChildFilter {
    /// Spawns the filter child and sends the configuration preamble.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the child cannot be spawned.
    pub fn spawn(spec: &FilterSpec) -> Result<Self> {
        log::debug!("spawning filter child {}", spec.name());

        let mut child = Command::new(spec.program())
            .args(spec.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or(Error::FilterProtocol("filter child has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(Error::FilterProtocol("filter child has no stdout"))?;

        let mut runner = Self {
            name: spec.name().to_owned(),
            reads: spec.reads().to_vec(),
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout),
        };

        runner.send_preamble(spec)?;

        Ok(runner)
    }

    fn send_preamble(&mut self, spec: &FilterSpec) -> Result<()> {
        proto::send_string(&mut self.stdin, spec.name())?;
        proto::send_string_array(&mut self.stdin, spec.args())?;
        proto::send_int(&mut self.stdin, spec.threshold())?;
        proto::send_blob(&mut self.stdin, spec.blob())?;
        self.stdin.flush()?;
        Ok(())
    }
}

impl FilterRunner for ChildFilter {
    fn eval(&mut self, obj: &mut Object) -> Result<i64> {
        proto::send_blob(&mut self.stdin, obj.data())?;

        let provided = self
            .reads
            .iter()
            .filter(|name| obj.attrs().get(name).is_some())
            .cloned()
            .collect::<Vec<_>>();

        proto::send_string_array(&mut self.stdin, &provided)?;

        for name in &provided {
            if let Some(value) = obj.attrs().get(name) {
                proto::send_blob(&mut self.stdin, value)?;
            }
        }

        self.stdin.flush()?;

        // attribute writes until the verdict arrives
        loop {
            let (tag, body) = proto::read_record(&mut self.stdout)?;

            match tag {
                proto::Tag::Int => {
                    let verdict = std::str::from_utf8(&body)
                        .ok()
                        .and_then(|s| s.trim().parse::<i64>().ok())
                        .ok_or(Error::FilterProtocol("bad verdict body"))?;

                    return Ok(verdict);
                }
                proto::Tag::Str => {
                    let name = proto::parse_string(&body)?;
                    let value = proto::get_blob(&mut self.stdout)?;
                    obj.attrs_mut().set(&name, value, AttrOrigin::FilterProduced)?;
                }
                _ => return Err(Error::FilterProtocol("unexpected record during eval")),
            }
        }
    }

    fn shutdown(mut self: Box<Self>) -> Result<()> {
        log::debug!("reaping filter child {}", self.name);

        // best-effort: the child may already be gone
        let _ = proto::send_end(&mut self.stdin);
        let _ = self.stdin.flush();
        drop(self.stdin);

        let deadline = Instant::now() + CHILD_REAP_GRACE;

        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return Ok(()),
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(25));
                }
                Ok(None) => {
                    log::warn!("filter child {} ignored end record, killing", self.name);
                    self.child.kill()?;
                    self.child.wait()?;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// An in-process filter backed by a closure. Test seam; production filters
/// always run out-of-process.
pub struct FnFilter<F> {
    func: F,
}

impl<F: FnMut(&mut Object) -> i64 + Send> FnFilter<F> {
    /// Wraps a closure as a filter.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F: FnMut(&mut Object) -> i64 + Send> FilterRunner for FnFilter<F> {
    fn eval(&mut self, obj: &mut Object) -> Result<i64> {
        Ok((self.func)(obj))
    }

    fn shutdown(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{FilterRunner, FnFilter};
    use crate::Object;
    use test_log::test;

    #[test]
    fn fn_filter_sees_payload_and_writes_attrs() {
        let mut filter = FnFilter::new(|obj: &mut Object| {
            let len = obj.len();
            obj.attrs_mut()
                .set("len", len.to_string().into_bytes(), crate::AttrOrigin::FilterProduced)
                .expect("should set");
            i64::from(len > 2)
        });

        let mut obj = Object::from_bytes(b"abcd".to_vec());
        assert_eq!(1, filter.eval(&mut obj).expect("should eval"));
        assert_eq!(Some(b"4".as_slice()), obj.attrs().get("len"));

        let mut obj = Object::from_bytes(b"a".to_vec());
        assert_eq!(0, filter.eval(&mut obj).expect("should eval"));
    }
}
