//! Duplex pipeline turning messages into wire bytes and back.
//!
//! Each direction is a chain of [Stage]s around a core JSON-RPC stage. Extensions
//! (stamping, signing, metering..) splice their own stages before or after it.
//! A failing stage drops the message and is reported through
//! [Messenger::subscribe_errors], the sender of a call only ever sees a timeout.

mod jsonrpc;

use std::fmt::{self, Debug, Formatter};

use bytes::Bytes;
use flume::{Receiver, Sender};
use serde_json::{json, Value};
use tracing::{trace, warn};

use crate::common::Contact;

pub use jsonrpc::{ErrorObject, Message, IDENTIFY, JSONRPC_VERSION};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
/// Errors raised while transforming a message.
pub enum MessengerError {
    #[error("Invalid message type \"{0}\"")]
    /// The payload is a notification or not JSON-RPC at all.
    InvalidMessageType(&'static str),

    #[error("Invalid sender identity: {0}")]
    InvalidIdentity(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("{0}")]
    /// Raised by an extension stage.
    Stage(String),
}

impl From<serde_json::Error> for MessengerError {
    fn from(error: serde_json::Error) -> Self {
        MessengerError::Malformed(error.to_string())
    }
}

#[derive(Debug, Clone)]
/// A message on its way out, before encoding.
pub struct Outbound {
    pub message: Message,
    pub sender: Contact,
    pub receiver: Contact,
}

#[derive(Debug, Clone)]
/// An encoded message ready for the transport.
pub struct Packet {
    /// Id of the encoded message.
    pub id: String,
    pub buffer: Bytes,
    pub receiver: Contact,
}

#[derive(Debug, Clone)]
/// A decoded message and the contact that sent it.
pub struct Inbound {
    pub message: Message,
    pub sender: Contact,
}

/// A transformation step of the [Messenger] pipeline.
pub trait Stage<T>: Send {
    fn transform(&mut self, item: T) -> Result<T, MessengerError>;
}

impl<T, F> Stage<T> for F
where
    F: FnMut(T) -> Result<T, MessengerError> + Send,
{
    fn transform(&mut self, item: T) -> Result<T, MessengerError> {
        self(item)
    }
}

struct Chain<T> {
    stages: Vec<Box<dyn Stage<T>>>,
}

impl<T> Chain<T> {
    fn run(&mut self, mut item: T) -> Result<T, MessengerError> {
        for stage in self.stages.iter_mut() {
            item = stage.transform(item)?;
        }

        Ok(item)
    }
}

impl<T> Default for Chain<T> {
    fn default() -> Self {
        Chain { stages: Vec::new() }
    }
}

impl<T> Debug for Chain<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Chain({} stages)", self.stages.len())
    }
}

#[derive(Debug, Default)]
/// Outgoing half of the pipeline.
pub struct Serializer {
    before: Chain<Outbound>,
    after: Chain<Packet>,
}

impl Serializer {
    /// Run `stage` on structured messages, before any previously prepended stage.
    pub fn prepend(&mut self, stage: impl Stage<Outbound> + 'static) {
        self.before.stages.insert(0, Box::new(stage));
    }

    /// Run `stage` on encoded packets, after any previously appended stage.
    pub fn append(&mut self, stage: impl Stage<Packet> + 'static) {
        self.after.stages.push(Box::new(stage));
    }

    fn run(&mut self, outbound: Outbound) -> Result<Packet, MessengerError> {
        let outbound = self.before.run(outbound)?;
        let packet = encode(outbound)?;

        self.after.run(packet)
    }
}

#[derive(Debug, Default)]
/// Incoming half of the pipeline.
pub struct Deserializer {
    before: Chain<Bytes>,
    after: Chain<Inbound>,
}

impl Deserializer {
    /// Run `stage` on raw buffers, before any previously prepended stage.
    pub fn prepend(&mut self, stage: impl Stage<Bytes> + 'static) {
        self.before.stages.insert(0, Box::new(stage));
    }

    /// Run `stage` on decoded messages, after any previously appended stage.
    pub fn append(&mut self, stage: impl Stage<Inbound> + 'static) {
        self.after.stages.push(Box::new(stage));
    }

    fn run(&mut self, buffer: Bytes) -> Result<Inbound, MessengerError> {
        let buffer = self.before.run(buffer)?;
        let inbound = decode(&buffer)?;

        self.after.run(inbound)
    }
}

#[derive(Debug, Default)]
pub struct Messenger {
    pub serializer: Serializer,
    pub deserializer: Deserializer,
    observers: Vec<Sender<MessengerError>>,
}

impl Messenger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every error raised by either half of the pipeline.
    pub fn subscribe_errors(&mut self) -> Receiver<MessengerError> {
        let (sender, receiver) = flume::unbounded();
        self.observers.push(sender);

        receiver
    }

    /// Encode an outgoing message, or drop it if any stage fails.
    pub fn serialize(&mut self, outbound: Outbound) -> Option<Packet> {
        let receiver = outbound.receiver.address().to_string();

        match self.serializer.run(outbound) {
            Ok(packet) => Some(packet),
            Err(error) => {
                warn!(context = "messenger", ?error, %receiver, "Dropped outgoing message");
                self.emit(error);

                None
            }
        }
    }

    /// Decode an incoming buffer, or drop it if any stage fails.
    pub fn deserialize(&mut self, buffer: Bytes) -> Option<Inbound> {
        match self.deserializer.run(buffer) {
            Ok(inbound) => Some(inbound),
            Err(error) => {
                trace!(context = "messenger", ?error, "Dropped incoming message");
                self.emit(error);

                None
            }
        }
    }

    fn emit(&mut self, error: MessengerError) {
        self.observers
            .retain(|observer| observer.send(error.clone()).is_ok());
    }
}

/// Core serializing stage: `[message, IDENTIFY(sender)]` as a JSON-RPC batch.
pub fn encode(outbound: Outbound) -> Result<Packet, MessengerError> {
    let batch = json!([
        outbound.message.to_json(),
        jsonrpc::identify(&outbound.sender)
    ]);

    Ok(Packet {
        id: outbound.message.id().to_string(),
        buffer: serde_json::to_vec(&batch)?.into(),
        receiver: outbound.receiver,
    })
}

/// Core deserializing stage, the reverse of [encode].
pub fn decode(buffer: &[u8]) -> Result<Inbound, MessengerError> {
    let value: Value = serde_json::from_slice(buffer)?;

    let Value::Array(mut batch) = value else {
        return Err(MessengerError::InvalidMessageType("invalid"));
    };

    if batch.len() != 2 {
        return Err(MessengerError::InvalidMessageType("invalid"));
    }

    let notification = batch.pop().unwrap_or(Value::Null);
    let message = batch.pop().unwrap_or(Value::Null);

    let message = Message::from_json(message)?;
    let sender = jsonrpc::parse_identify(notification)?;

    Ok(Inbound { message, sender })
}

#[cfg(test)]
mod test {
    use crate::common::{Address, Id};

    use super::*;

    fn outbound(message: Message) -> Outbound {
        Outbound {
            message,
            sender: Contact::new(Id::random(), Address::new("127.0.0.1", 8080)),
            receiver: Contact::new(Id::random(), Address::new("127.0.0.1", 8081)),
        }
    }

    #[test]
    fn round_trip() {
        let mut messenger = Messenger::new();
        let outbound = outbound(Message::request("FIND_NODE", json!([Id::random()])));

        let packet = messenger.serialize(outbound.clone()).unwrap();

        assert_eq!(packet.id, outbound.message.id());
        assert_eq!(packet.receiver, outbound.receiver);

        let inbound = messenger.deserialize(packet.buffer).unwrap();

        assert_eq!(inbound.message, outbound.message);
        assert_eq!(inbound.sender, outbound.sender);
    }

    #[test]
    fn batch_layout() {
        let outbound = outbound(Message::success("abc", json!([])));
        let packet = encode(outbound.clone()).unwrap();

        let value: Value = serde_json::from_slice(&packet.buffer).unwrap();

        assert_eq!(
            value,
            json!([
                {"jsonrpc": "2.0", "id": "abc", "result": []},
                {"jsonrpc": "2.0", "method": "IDENTIFY", "params": outbound.sender}
            ])
        );
    }

    #[test]
    fn drops_invalid_messages() {
        let mut messenger = Messenger::new();
        let errors = messenger.subscribe_errors();

        let sender = Contact::new(Id::random(), Address::new("127.0.0.1", 8080));
        let notification = json!([
            {"jsonrpc": "2.0", "method": "PING", "params": []},
            {"jsonrpc": "2.0", "method": "IDENTIFY", "params": sender}
        ]);

        assert!(messenger
            .deserialize(serde_json::to_vec(&notification).unwrap().into())
            .is_none());
        assert_eq!(
            errors.try_recv().unwrap().to_string(),
            "Invalid message type \"notification\""
        );

        assert!(messenger.deserialize(Bytes::from_static(b"{]")).is_none());
        assert!(matches!(
            errors.try_recv(),
            Ok(MessengerError::Malformed(_))
        ));

        assert!(messenger.deserialize(Bytes::from_static(b"[]")).is_none());
        assert_eq!(
            errors.try_recv(),
            Ok(MessengerError::InvalidMessageType("invalid"))
        );
    }

    #[test]
    fn extension_stages() {
        let mut messenger = Messenger::new();

        messenger
            .serializer
            .append(|mut packet: Packet| -> Result<Packet, MessengerError> {
                let mut stamped = b"stamp:".to_vec();
                stamped.extend_from_slice(&packet.buffer);
                packet.buffer = stamped.into();

                Ok(packet)
            });
        messenger
            .deserializer
            .prepend(|buffer: Bytes| -> Result<Bytes, MessengerError> {
                if buffer.starts_with(b"stamp:") {
                    Ok(buffer.slice(6..))
                } else {
                    Err(MessengerError::Stage("missing stamp".into()))
                }
            });

        let outbound = outbound(Message::request("PING", json!([])));
        let packet = messenger.serialize(outbound.clone()).unwrap();

        assert!(packet.buffer.starts_with(b"stamp:"));

        let inbound = messenger.deserialize(packet.buffer).unwrap();
        assert_eq!(inbound.message, outbound.message);

        let errors = messenger.subscribe_errors();
        let unstamped = encode(outbound).unwrap();

        assert!(messenger.deserialize(unstamped.buffer).is_none());
        assert_eq!(
            errors.try_recv(),
            Ok(MessengerError::Stage("missing stamp".into()))
        );
    }

    fn push_param(tag: &'static str) -> impl Stage<Outbound> {
        move |mut outbound: Outbound| -> Result<Outbound, MessengerError> {
            if let Message::Request { params, .. } = &mut outbound.message {
                if let Some(params) = params.as_array_mut() {
                    params.push(json!(tag));
                }
            }
            Ok(outbound)
        }
    }

    #[test]
    fn stage_order() {
        let mut messenger = Messenger::new();

        messenger.serializer.prepend(push_param("first"));
        messenger.serializer.prepend(push_param("second"));

        let packet = messenger
            .serialize(outbound(Message::request("PING", json!([]))))
            .unwrap();
        let inbound = decode(&packet.buffer).unwrap();

        assert_eq!(
            inbound.message,
            Message::Request {
                id: packet.id,
                method: "PING".into(),
                params: json!(["second", "first"]),
            }
        );
    }

    #[test]
    fn failing_stage_drops_outgoing_message() {
        let mut messenger = Messenger::new();
        let errors = messenger.subscribe_errors();

        messenger
            .serializer
            .prepend(|_: Outbound| -> Result<Outbound, MessengerError> {
                Err(MessengerError::Stage("no stamp".into()))
            });

        assert!(messenger
            .serialize(outbound(Message::request("PING", json!([]))))
            .is_none());
        assert_eq!(errors.try_recv(), Ok(MessengerError::Stage("no stamp".into())));
    }
}
