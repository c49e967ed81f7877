// Copyright 2025 Protocol Labs.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Instant,
};

use futures::{AsyncRead, AsyncWrite};

use crate::{
    network::{MuxedStream, StreamErrorCode, INTERNAL_ERROR},
    provider,
};

/// A single stream on a connection.
pub struct Stream<S> {
    inner: S,
}

impl<S: provider::Stream> Stream<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: provider::Stream> AsyncRead for Stream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: provider::Stream> AsyncWrite for Stream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_close(cx)
    }
}

impl<S: provider::Stream> MuxedStream for Stream<S> {
    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }

    /// The substrate cannot stop the read half on its own, so this does nothing.
    fn close_read(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn close_write(&mut self) -> io::Result<()> {
        self.inner.close_write()
    }

    fn reset(&mut self) -> io::Result<()> {
        self.inner.reset(INTERNAL_ERROR)
    }

    fn reset_with_error(&mut self, code: StreamErrorCode) -> io::Result<()> {
        self.inner.reset(code)
    }

    fn set_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.inner.set_read_deadline(deadline)?;
        self.inner.set_write_deadline(deadline)
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.inner.set_read_deadline(deadline)
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.inner.set_write_deadline(deadline)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use futures::{AsyncReadExt, AsyncWriteExt};
    use parking_lot::Mutex;

    use super::*;

    /// Records every call made on it.
    #[derive(Clone, Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<String>>>,
        fail_read_deadline: bool,
    }

    impl Recorder {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }
    }

    impl AsyncRead for Recorder {
        fn poll_read(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<io::Result<usize>> {
            let n = buf.len().min(4);
            buf[..n].copy_from_slice(&b"data"[..n]);
            Poll::Ready(Ok(n))
        }
    }

    impl AsyncWrite for Recorder {
        fn poll_write(
            self: Pin<&mut Self>,
            _: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.record(format!("write {}", buf.len()));
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    impl provider::Stream for Recorder {
        fn close(&mut self) -> io::Result<()> {
            self.record("close");
            Ok(())
        }

        fn close_write(&mut self) -> io::Result<()> {
            self.record("close_write");
            Ok(())
        }

        fn reset(&mut self, code: u32) -> io::Result<()> {
            self.record(format!("reset {code}"));
            Ok(())
        }

        fn set_read_deadline(&mut self, _: Option<Instant>) -> io::Result<()> {
            if self.fail_read_deadline {
                return Err(io::Error::other("read deadline refused"));
            }
            self.record("read_deadline");
            Ok(())
        }

        fn set_write_deadline(&mut self, _: Option<Instant>) -> io::Result<()> {
            self.record("write_deadline");
            Ok(())
        }
    }

    #[test]
    fn combined_deadline_sets_both_halves() {
        let recorder = Recorder::default();
        let mut stream = Stream::new(recorder.clone());
        stream
            .set_deadline(Some(Instant::now() + Duration::from_secs(1)))
            .unwrap();
        assert_eq!(recorder.calls(), ["read_deadline", "write_deadline"]);
    }

    #[test]
    fn combined_deadline_stops_at_first_failure() {
        let recorder = Recorder {
            fail_read_deadline: true,
            ..Default::default()
        };
        let mut stream = Stream::new(recorder.clone());
        let error = stream.set_deadline(None).unwrap_err();
        assert_eq!(error.to_string(), "read deadline refused");
        assert!(recorder.calls().is_empty());
    }

    #[test]
    fn reset_defaults_to_internal_error() {
        let recorder = Recorder::default();
        let mut stream = Stream::new(recorder.clone());
        stream.reset().unwrap();
        stream.reset_with_error(7).unwrap();
        assert_eq!(recorder.calls(), [format!("reset {INTERNAL_ERROR}"), "reset 7".into()]);
    }

    #[test]
    fn close_read_is_a_no_op() {
        let recorder = Recorder::default();
        let mut stream = Stream::new(recorder.clone());
        stream.close_read().unwrap();
        assert!(recorder.calls().is_empty());

        stream.close_write().unwrap();
        MuxedStream::close(&mut stream).unwrap();
        assert_eq!(recorder.calls(), ["close_write", "close"]);
    }

    #[test]
    fn io_passes_through() {
        futures::executor::block_on(async {
            let recorder = Recorder::default();
            let mut stream = Stream::new(recorder.clone());
            stream.write_all(b"ping").await.unwrap();

            let mut buf = [0; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"data");
            assert_eq!(recorder.calls(), ["write 4"]);
        });
    }
}
