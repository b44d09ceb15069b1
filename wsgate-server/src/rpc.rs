//! Server-side RPC dispatch: modules of named methods invoked by
//! `headers["id"] = "module.method"`.

use crate::service::{Outbox, Service};
use std::collections::HashMap;
use wsgate_protocol::{Envelope, Message, OpCode, WireFormat};

/// Return code header value for a successful call.
pub const RC_OK: &str = "0";
/// Return code header value for a dispatch failure.
pub const RC_ERROR: &str = "1";

/// A method handler: takes the request envelope, returns the reply content
/// or an error message.
pub type Handler = Box<dyn Fn(&Envelope) -> Result<Envelope, String> + Send + Sync>;

/// A named group of methods.
#[derive(Default)]
pub struct Module {
    methods: HashMap<String, Handler>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a method under `name` (builder style).
    pub fn method<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Envelope) -> Result<Envelope, String> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Box::new(f));
        self
    }

    fn get(&self, name: &str) -> Option<&Handler> {
        self.methods.get(name)
    }
}

/// The dispatch table: modules keyed by name.
///
/// `System` implements [`Service`], so it can be handed to
/// [`WsServer`](crate::server::WsServer) directly. Inbound messages are
/// decoded as envelopes (binary or JSON by auto-detect); the reply is
/// encoded in the request's detected format and echoes the request's
/// routing map, correlation tag included.
#[derive(Default)]
pub struct System {
    modules: HashMap<String, Module>,
}

impl System {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a module under `name` (builder style).
    pub fn module(mut self, name: impl Into<String>, module: Module) -> Self {
        self.modules.insert(name.into(), module);
        self
    }

    /// Dispatches one request envelope to its handler.
    ///
    /// A missing or malformed `id` header, an unknown module or method, or
    /// a handler error all produce a reply with `rc != "0"` and a `msg`
    /// header. The reply always carries the request's routing map and
    /// format.
    pub fn dispatch(&self, request: &Envelope) -> Envelope {
        let reply = match self.call(request) {
            Ok(mut reply) => {
                if reply.headers.get("rc").is_none() {
                    reply.headers.insert("rc", RC_OK);
                }
                reply
            }
            Err(msg) => {
                tracing::debug!("dispatch error: {}", msg);
                Envelope::new()
                    .with_header("rc", RC_ERROR)
                    .with_header("msg", msg)
            }
        };
        Envelope {
            routing: request.routing.clone(),
            format: request.format,
            ..reply
        }
    }

    fn call(&self, request: &Envelope) -> Result<Envelope, String> {
        let id = request
            .headers
            .get("id")
            .ok_or_else(|| "missing id header".to_string())?;
        let (module_name, method_name) = id
            .split_once('.')
            .ok_or_else(|| format!("malformed id: {id}"))?;

        let module = self
            .modules
            .get(module_name)
            .ok_or_else(|| format!("unknown module: {module_name}"))?;
        let handler = module
            .get(method_name)
            .ok_or_else(|| format!("unknown method: {id}"))?;

        handler(request)
    }
}

impl Service for System {
    fn process(&self, cid: u64, message: Message, out: &mut Outbox) {
        let request = match Envelope::decode(&message.data) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!("[cid={}] undecodable envelope: {}", cid, e);
                let reply = Envelope::new()
                    .with_header("rc", RC_ERROR)
                    .with_header("msg", format!("bad envelope: {e}"));
                send_reply(cid, reply, out);
                return;
            }
        };

        let reply = self.dispatch(&request);
        send_reply(cid, reply, out);
    }
}

/// Encodes a reply in its own format and queues it; binary envelopes travel
/// in Binary frames, JSON envelopes in Text frames.
fn send_reply(cid: u64, reply: Envelope, out: &mut Outbox) {
    let opcode = match reply.format {
        WireFormat::Binary => OpCode::Binary,
        WireFormat::Json => OpCode::Text,
    };
    match reply.encode() {
        Ok(bytes) => out.send(
            cid,
            Message {
                opcode,
                data: bytes,
            },
        ),
        Err(e) => tracing::error!("[cid={}] reply encode failed: {}", cid, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::Action;

    fn echo_system() -> System {
        System::new().module(
            "sys",
            Module::new()
                .method("echo", |req: &Envelope| {
                    Ok(Envelope::new().with_content(req.content.clone()))
                })
                .method("fail", |_req: &Envelope| Err("it broke".to_string())),
        )
    }

    fn request(id: &str) -> Envelope {
        Envelope::new()
            .with_routing("tag", "abc1234")
            .with_header("id", id)
            .with_content(&b"ping"[..])
    }

    #[test]
    fn test_dispatch_success_echoes_routing() {
        let system = echo_system();
        let reply = system.dispatch(&request("sys.echo"));
        assert_eq!(reply.headers.get("rc"), Some(RC_OK));
        assert_eq!(reply.routing.get("tag"), Some("abc1234"));
        assert_eq!(reply.content.as_ref(), b"ping");
    }

    #[test]
    fn test_dispatch_unknown_module() {
        let system = echo_system();
        let reply = system.dispatch(&request("nope.echo"));
        assert_eq!(reply.headers.get("rc"), Some(RC_ERROR));
        assert!(reply.headers.get("msg").unwrap().contains("unknown module"));
        assert_eq!(reply.routing.get("tag"), Some("abc1234"));
    }

    #[test]
    fn test_dispatch_unknown_method() {
        let system = echo_system();
        let reply = system.dispatch(&request("sys.nope"));
        assert_eq!(reply.headers.get("rc"), Some(RC_ERROR));
        assert!(reply.headers.get("msg").unwrap().contains("unknown method"));
    }

    #[test]
    fn test_dispatch_missing_id() {
        let system = echo_system();
        let req = Envelope::new().with_routing("tag", "zzz0000");
        let reply = system.dispatch(&req);
        assert_eq!(reply.headers.get("rc"), Some(RC_ERROR));
        assert!(reply.headers.get("msg").unwrap().contains("missing id"));
    }

    #[test]
    fn test_dispatch_malformed_id() {
        let system = echo_system();
        let req = Envelope::new().with_header("id", "noseparator");
        let reply = system.dispatch(&req);
        assert_eq!(reply.headers.get("rc"), Some(RC_ERROR));
        assert!(reply.headers.get("msg").unwrap().contains("malformed id"));
    }

    #[test]
    fn test_handler_error_surfaces_in_msg() {
        let system = echo_system();
        let reply = system.dispatch(&request("sys.fail"));
        assert_eq!(reply.headers.get("rc"), Some(RC_ERROR));
        assert_eq!(reply.headers.get("msg"), Some("it broke"));
    }

    #[test]
    fn test_reply_format_follows_request() {
        let system = echo_system();
        let req = request("sys.echo").with_format(WireFormat::Json);
        let reply = system.dispatch(&req);
        assert_eq!(reply.format, WireFormat::Json);
    }

    #[test]
    fn test_service_roundtrip_binary_frame() {
        let system = echo_system();
        let wire = request("sys.echo").encode().unwrap();
        let mut out = Outbox::new();
        system.process(9, Message::binary(wire), &mut out);

        let actions: Vec<_> = out.drain().collect();
        match &actions[..] {
            [(9, Action::Send(msg))] => {
                assert_eq!(msg.opcode, OpCode::Binary);
                let reply = Envelope::decode(&msg.data).unwrap();
                assert_eq!(reply.headers.get("rc"), Some(RC_OK));
                assert_eq!(reply.routing.get("tag"), Some("abc1234"));
            }
            other => panic!("unexpected actions: {}", other.len()),
        }
    }

    #[test]
    fn test_service_accepts_json_text_frame() {
        let system = echo_system();
        let wire = request("sys.echo")
            .with_format(WireFormat::Json)
            .encode()
            .unwrap();
        let mut out = Outbox::new();
        system.process(9, Message::text(wire), &mut out);

        let actions: Vec<_> = out.drain().collect();
        match &actions[..] {
            [(9, Action::Send(msg))] => {
                assert_eq!(msg.opcode, OpCode::Text);
                let reply = Envelope::decode(&msg.data).unwrap();
                assert_eq!(reply.format, WireFormat::Json);
                assert_eq!(reply.headers.get("rc"), Some(RC_OK));
            }
            other => panic!("unexpected actions: {}", other.len()),
        }
    }

    #[test]
    fn test_undecodable_envelope_gets_error_reply() {
        let system = echo_system();
        let mut out = Outbox::new();
        system.process(9, Message::binary(vec![0x93, 0x01]), &mut out);
        let actions: Vec<_> = out.drain().collect();
        match &actions[..] {
            [(9, Action::Send(msg))] => {
                let reply = Envelope::decode(&msg.data).unwrap();
                assert_eq!(reply.headers.get("rc"), Some(RC_ERROR));
            }
            other => panic!("unexpected actions: {}", other.len()),
        }
    }
}
