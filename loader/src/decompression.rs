//! Transparent decompression for downloaded archives.
//!
//! Registries hand out `.tar.gz`, `.tar.bz2`, `.tar.xz` and plain `.tar`
//! under extensions that don't always tell the truth, so the codec is picked
//! by sniffing magic bytes off the head of the stream rather than trusting
//! the filename. Unknown magic falls through unchanged, which is how plain
//! tar (and any other passthrough payload) is handled.

use std::{
    io, mem,
    pin::Pin,
    task::{Context, Poll},
};

use async_compression::tokio::bufread::{BzDecoder, GzipDecoder, XzDecoder};
use futures::ready;
use pin_project::pin_project;
use tokio::io::{AsyncBufRead, AsyncRead, BufReader, ReadBuf};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const BZIP2_MAGIC: [u8; 3] = *b"BZh";
const XZ_MAGIC: [u8; 6] = [0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00];
const SNIFF_BYTES: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Codec {
    Gzip,
    Bzip2,
    Xz,
    Passthrough,
}

impl Codec {
    fn from_magic(magic: &[u8]) -> Self {
        if magic.starts_with(&GZIP_MAGIC) {
            Self::Gzip
        } else if magic.starts_with(&BZIP2_MAGIC) {
            Self::Bzip2
        } else if magic.starts_with(&XZ_MAGIC) {
            Self::Xz
        } else {
            Self::Passthrough
        }
    }
}

/// A reader replaying the sniffed prefix before the rest of the stream.
#[pin_project]
struct Rewound<R> {
    prefix: Vec<u8>,
    #[pin]
    inner: R,
}

impl<R> AsyncRead for Rewound<R>
where
    R: AsyncRead,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if !this.prefix.is_empty() {
            let n = this.prefix.len().min(buf.remaining());
            buf.put_slice(&this.prefix[..n]);
            this.prefix.drain(..n);
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

#[pin_project(project = StateProj)]
enum State<R> {
    /// Still collecting magic bytes.
    Sniffing { buffer: Vec<u8>, inner: Option<R> },
    Gzip(#[pin] GzipDecoder<BufReader<Rewound<R>>>),
    Bzip2(#[pin] BzDecoder<BufReader<Rewound<R>>>),
    Xz(#[pin] XzDecoder<BufReader<Rewound<R>>>),
    Passthrough(#[pin] BufReader<Rewound<R>>),
}

impl<R> State<R>
where
    R: AsyncBufRead,
{
    fn select(&mut self, codec: Codec) {
        let (prefix, inner) = match self {
            State::Sniffing { buffer, inner } => {
                (mem::take(buffer), inner.take().expect("sniffing without inner"))
            }
            _ => unreachable!("codec already selected"),
        };
        let inner = BufReader::new(Rewound { prefix, inner });

        *self = match codec {
            Codec::Gzip => State::Gzip(GzipDecoder::new(inner)),
            Codec::Bzip2 => State::Bzip2(BzDecoder::new(inner)),
            Codec::Xz => State::Xz(XzDecoder::new(inner)),
            Codec::Passthrough => State::Passthrough(inner),
        }
    }
}

impl<R> AsyncRead for State<R>
where
    R: AsyncBufRead,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            StateProj::Sniffing { .. } => unreachable!("poll_read before codec selection"),
            StateProj::Gzip(inner) => inner.poll_read(cx, buf),
            StateProj::Bzip2(inner) => inner.poll_read(cx, buf),
            StateProj::Xz(inner) => inner.poll_read(cx, buf),
            StateProj::Passthrough(inner) => inner.poll_read(cx, buf),
        }
    }
}

/// AsyncRead adapter yielding the decompressed payload of whatever
/// compression (or none) the underlying stream carries.
#[pin_project]
pub struct DecompressedReader<R> {
    #[pin]
    state: State<R>,
}

impl<R> DecompressedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            state: State::Sniffing {
                buffer: Vec::with_capacity(SNIFF_BYTES),
                inner: Some(inner),
            },
        }
    }
}

impl<R> AsyncRead for DecompressedReader<R>
where
    R: AsyncBufRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();

        let (buffer, inner) = match this.state.as_mut().project() {
            StateProj::Gzip(inner) => return inner.poll_read(cx, buf),
            StateProj::Bzip2(inner) => return inner.poll_read(cx, buf),
            StateProj::Xz(inner) => return inner.poll_read(cx, buf),
            StateProj::Passthrough(inner) => return inner.poll_read(cx, buf),
            StateProj::Sniffing { buffer, inner } => (buffer, inner),
        };

        let mut scratch = [0u8; SNIFF_BYTES];
        let mut scratch = ReadBuf::new(&mut scratch[..SNIFF_BYTES - buffer.len()]);
        if let Err(e) = ready!(Pin::new(inner.as_mut().expect("sniffing without inner"))
            .poll_read(cx, &mut scratch))
        {
            return Poll::Ready(Err(e));
        }

        buffer.extend_from_slice(scratch.filled());
        // A short read means EOF: whatever we have cannot be one of the
        // known codecs' magics, so hand the bytes through unchanged.
        if buffer.len() >= SNIFF_BYTES || scratch.filled().is_empty() {
            let codec = Codec::from_magic(buffer);
            this.state.as_mut().select(codec);
            this.state.poll_read(cx, buf)
        } else {
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
