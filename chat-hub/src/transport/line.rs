use std::io;

use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

use super::{MessageSink, MessageSource, MessageStream};
use crate::message::{ChatMessage, read_message, write_message};

/// JSON-lines framing over any buffered reader and writer pair.
pub struct LineStream<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> LineStream<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

impl LineStream<BufReader<OwnedReadHalf>, OwnedWriteHalf> {
    pub fn from_tcp(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self::new(BufReader::new(reader), writer)
    }
}

impl<R, W> MessageStream for LineStream<R, W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    type Source = LineSource<R>;
    type Sink = LineSink<W>;

    fn split(self) -> (Self::Source, Self::Sink) {
        (
            LineSource {
                reader: self.reader,
            },
            LineSink {
                writer: self.writer,
            },
        )
    }
}

pub struct LineSource<R> {
    reader: R,
}

impl<R> MessageSource for LineSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async fn receive(&mut self) -> io::Result<Option<ChatMessage>> {
        read_message(&mut self.reader).await
    }
}

pub struct LineSink<W> {
    writer: W,
}

impl<W> MessageSink for LineSink<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&mut self, message: &ChatMessage) -> io::Result<()> {
        write_message(&mut self.writer, message).await
    }
}
