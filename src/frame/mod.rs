//! Length prefixed frames protected by a [Cipher]
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes of cipher output. The
//! cipher of both halves can be replaced once the handshake has negotiated the session cipher.
use futures::prelude::*;
use std::sync::Arc;

use crate::crypto::{Cipher, CipherError};

mod reader;
mod writer;

pub use reader::FrameReader;
pub use writer::FrameWriter;

/// Largest frame body accepted from the peer.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub(crate) const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to encrypt or decrypt frame")]
    Cipher(#[from] CipherError),

    /// Frame exceeds [MAX_FRAME_SIZE]
    #[error("frame of {0} bytes exceeds maximum frame size")]
    TooLarge(usize),
}

/// Split a connection into a [FrameWriter] and a [FrameReader] that both use `cipher`.
pub fn framed<Conn: AsyncRead + AsyncWrite + Unpin>(
    conn: Conn,
    cipher: Arc<dyn Cipher>,
) -> (
    FrameWriter<futures::io::WriteHalf<Conn>>,
    FrameReader<futures::io::ReadHalf<Conn>>,
) {
    let (reader, writer) = conn.split();
    (
        FrameWriter::new(writer, cipher.clone()),
        FrameReader::new(reader, cipher),
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::{Plaintext, SecretBox};
    use proptest::prelude::*;

    #[test_strategy::proptest]
    fn write_read(messages: Vec<Vec<u8>>, encrypted: bool) {
        let _ = sodiumoxide::init();
        async_std::task::block_on(async move {
            let cipher: Arc<dyn Cipher> = if encrypted {
                Arc::new(SecretBox::from_passphrase("frames"))
            } else {
                Arc::new(Plaintext)
            };
            let (writer, reader) = async_std::os::unix::net::UnixStream::pair().unwrap();
            let reader = FrameReader::new(reader, cipher.clone());
            let mut writer = FrameWriter::new(writer, cipher);

            let expected = messages.clone();
            let write_handle = async_std::task::spawn(async move {
                for data in messages {
                    writer.send(data).await.unwrap();
                }
                writer.close().await.unwrap();
            });
            let frames = reader.try_collect::<Vec<_>>().await.unwrap();
            prop_assert_eq!(frames, expected);
            write_handle.await;
            Ok(())
        })?;
    }

    #[test_strategy::proptest]
    fn early_termination(
        #[strategy(proptest::collection::vec(any::<u8>(), 1..30))] data: Vec<u8>,
        cutoff: proptest::sample::Index,
    ) {
        async_std::task::block_on(async move {
            let (raw_writer, raw_reader) = async_std::os::unix::net::UnixStream::pair().unwrap();
            let cutoff = 1 + cutoff.index(LENGTH_PREFIX_SIZE + data.len() - 1);
            let raw_reader = raw_reader.take(cutoff as u64);
            let reader = FrameReader::new(raw_reader, Arc::new(Plaintext));
            let mut writer = FrameWriter::new(raw_writer, Arc::new(Plaintext));

            async_std::task::spawn(async move {
                let _ = writer.send(data).await;
            });

            let items = reader.collect::<Vec<_>>().await;
            let err = items.last().unwrap().as_ref().unwrap_err();
            match err {
                FrameError::Io(io_error) => {
                    prop_assert_eq!(io_error.kind(), std::io::ErrorKind::UnexpectedEof)
                }
                _ => prop_assert!(false),
            }
            Ok(())
        })?;
    }

    #[async_std::test]
    async fn truncated_length_prefix() {
        for length in 1..LENGTH_PREFIX_SIZE {
            let data = vec![0u8; length];
            let items = FrameReader::new(&data[..], Arc::new(Plaintext))
                .collect::<Vec<_>>()
                .await;
            assert_eq!(items.len(), 1);
            match &items[0] {
                Err(FrameError::Io(error)) => {
                    assert_eq!(error.kind(), std::io::ErrorKind::UnexpectedEof)
                }
                item => panic!("unexpected item {:?}", item),
            }
        }
    }

    #[async_std::test]
    async fn empty_reader_ends_cleanly() {
        let items = FrameReader::new(&[][..], Arc::new(Plaintext))
            .collect::<Vec<_>>()
            .await;
        assert!(items.is_empty());
    }

    #[async_std::test]
    async fn switch_cipher() {
        let _ = sodiumoxide::init();
        let (a, b) = async_std::os::unix::net::UnixStream::pair().unwrap();
        let (mut writer, _) = framed(a, Arc::new(Plaintext));
        let (_, mut reader) = framed(b, Arc::new(Plaintext));

        writer.send(b"clear".to_vec()).await.unwrap();
        assert_eq!(reader.try_next().await.unwrap().unwrap(), b"clear".to_vec());

        let cipher: Arc<dyn Cipher> = Arc::new(SecretBox::from_passphrase("switch"));
        writer.set_cipher(cipher.clone());
        reader.set_cipher(cipher);
        writer.send(b"secret".to_vec()).await.unwrap();
        assert_eq!(reader.try_next().await.unwrap().unwrap(), b"secret".to_vec());
    }

    #[async_std::test]
    async fn reject_large_frame() {
        let (mut a, b) = async_std::os::unix::net::UnixStream::pair().unwrap();
        let mut reader = FrameReader::new(b, Arc::new(Plaintext));
        a.write_all(&(MAX_FRAME_SIZE as u32 + 1).to_be_bytes())
            .await
            .unwrap();
        match reader.try_next().await {
            Err(FrameError::TooLarge(size)) => assert_eq!(size, MAX_FRAME_SIZE + 1),
            result => panic!("unexpected result {:?}", result),
        }
        assert!(reader.next().await.is_none());
    }
}
