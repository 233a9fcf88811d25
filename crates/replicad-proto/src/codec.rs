//! Length-delimited MessagePack codec for tokio.
//!
//! Every frame is a 4-byte big-endian length followed by one message
//! encoded with `rmp-serde` (named fields).

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::ProtoError;
use crate::message::{DownstreamMessage, UpstreamMessage};

/// Largest frame either side accepts.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

/// Codec decoding `In` and encoding `Out`.
pub struct MessageCodec<In, Out> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<fn(Out) -> In>,
}

/// Server side: decodes upstream, encodes downstream.
pub type ServerCodec = MessageCodec<UpstreamMessage, DownstreamMessage>;

/// Client side: decodes downstream, encodes upstream.
pub type ClientCodec = MessageCodec<DownstreamMessage, UpstreamMessage>;

impl<In, Out> MessageCodec<In, Out> {
    pub fn new() -> Self {
        Self::with_max_frame(MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame(max_len: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(max_len)
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<In, Out> Default for MessageCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: DeserializeOwned, Out> Decoder for MessageCodec<In, Out> {
    type Item = In;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>, ProtoError> {
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(rmp_serde::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

impl<In, Out: Serialize> Encoder<Out> for MessageCodec<In, Out> {
    type Error = ProtoError;

    fn encode(&mut self, msg: Out, dst: &mut BytesMut) -> Result<(), ProtoError> {
        let payload = rmp_serde::to_vec_named(&msg)?;
        self.inner.encode(Bytes::from(payload), dst)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DEvent;
    use crate::message::AuthRequest;

    #[test]
    fn client_frames_decode_on_server() {
        let mut client = ClientCodec::new();
        let mut server = ServerCodec::new();
        let mut buf = BytesMut::new();

        client
            .encode(
                UpstreamMessage::Authenticate(AuthRequest {
                    username: "alice".into(),
                    password: "pw".into(),
                    boot_groups: vec!["game".into()],
                }),
                &mut buf,
            )
            .unwrap();
        client
            .encode(
                UpstreamMessage::ForwardEvent {
                    event: DEvent::message(5, "chat", vec!["hi".into()]),
                },
                &mut buf,
            )
            .unwrap();

        let first = server.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, UpstreamMessage::Authenticate(ref a) if a.username == "alice"));
        let second = server.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.name(), "forward_event");
        assert!(server.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let mut server = ServerCodec::new();
        let mut client = ClientCodec::new();
        let mut full = BytesMut::new();
        client
            .encode(UpstreamMessage::Ping { client_stamp: 99 }, &mut full)
            .unwrap();

        let mut partial = full.split_to(full.len() - 1);
        assert!(server.decode(&mut partial).unwrap().is_none());
        partial.unsplit(full);
        let msg = server.decode(&mut partial).unwrap().unwrap();
        assert_eq!(msg, UpstreamMessage::Ping { client_stamp: 99 });
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut server = ServerCodec::with_max_frame(16);
        let mut client = ClientCodec::new();
        let mut buf = BytesMut::new();
        client
            .encode(
                UpstreamMessage::ForwardEvent {
                    event: DEvent::message(5, "a-rather-long-message-name", vec![]),
                },
                &mut buf,
            )
            .unwrap();
        let err = server.decode(&mut buf).unwrap_err();
        assert_eq!(err.error_code(), "io");
    }
}
