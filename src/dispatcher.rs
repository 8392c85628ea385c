//! RPC Dispatcher (spec.md §4.4): routes inbound requests by their first
//! Uri-Path segment to the registered functions, variables, and
//! subscriptions, enforcing the capacity/length/permission rules.
//!
//! `Hello`'s and `GetTime`'s ack responses are *not* routed here: they
//! resolve as ordinary multiplexer waiters registered by whoever sent the
//! request (the session supervisor), since both are acks correlating to
//! a message this device itself sent. This module only handles fresh,
//! non-ack requests the cloud initiates.

use bytes::Bytes;
use serde_json::json;

use crate::coap::{codes, CoapCode, Frame};
use crate::events::{ClientEvent, EventBus};
use crate::registry::{
    DeclaredType, FileRegistry, FunctionRegistry, OwnerList, SubscriptionRegistry, VariableRegistry,
    VariableValue, MAX_ARGS_LEN, MAX_ENCODED_VALUE_LEN,
};

/// Borrowed state the dispatcher needs; lives on the session engine and
/// is handed down for the duration of one `dispatch` call.
pub struct DispatchContext<'a> {
    pub functions: &'a FunctionRegistry,
    pub variables: &'a VariableRegistry,
    pub files: &'a FileRegistry,
    pub subscriptions: &'a SubscriptionRegistry,
    pub owners: &'a OwnerList,
    pub events: &'a EventBus,
    pub platform_id: u16,
    pub firmware_version: u16,
}

/// What the session loop should do after a dispatch call.
pub enum DispatchOutcome {
    Reply(Frame),
    NoReply,
    /// First segment was `g` (FileRequest) — the session routes this to
    /// the outbound OTA engine instead, since it owns the transport.
    RouteToFileRequest,
    /// First segment was `u` or `c` (OTA inbound) — routed to the inbound
    /// OTA engine, which owns the per-transfer buffer.
    RouteToOtaInbound,
    Unknown,
}

pub async fn dispatch(frame: &Frame, ctx: &DispatchContext<'_>) -> DispatchOutcome {
    match frame.first_path_segment() {
        Some(codes::DESCRIBE) => DispatchOutcome::Reply(handle_describe(frame, ctx)),
        Some(codes::FUNCTION) => handle_function(frame, ctx).await,
        Some(codes::VARIABLE) => handle_variable(frame, ctx).await,
        Some(codes::PUBLIC_EVENT) | Some(codes::PRIVATE_EVENT) => {
            handle_event(frame, ctx).await;
            DispatchOutcome::NoReply
        }
        Some(codes::SIGNAL_START) => DispatchOutcome::Reply(handle_signal_start(frame, ctx)),
        Some(codes::FILE_REQUEST) => DispatchOutcome::RouteToFileRequest,
        Some(codes::UPDATE) | Some(codes::CHUNK) => DispatchOutcome::RouteToOtaInbound,
        _ => DispatchOutcome::Unknown,
    }
}

fn handle_describe(frame: &Frame, ctx: &DispatchContext<'_>) -> Frame {
    let flags = frame
        .uri_query
        .first()
        .and_then(|q| q.parse::<u32>().ok())
        .unwrap_or(0);

    // METRICS (=4): a single diagnostic byte.
    if flags == 4 {
        return frame.respond(CoapCode::CONTENT, Bytes::from_static(&[0u8]));
    }

    let descriptor = json!({
        "f": ctx.functions.names(),
        "g": ctx.files.descriptors().into_iter().map(|(name, mime)| (name, json!([mime, "_callback"]))).collect::<serde_json::Map<_, _>>(),
        "m": [{"d": [], "f": "s", "n": "1", "v": ctx.firmware_version.to_string()}],
        "p": ctx.platform_id,
        "v": ctx.variables.declared_types().into_iter().map(|(name, ty)| (name, json!(declared_type_name(ty)))).collect::<serde_json::Map<_, _>>(),
    });
    let payload = serde_json::to_vec(&descriptor).unwrap_or_default();
    frame.respond(CoapCode::CONTENT, payload)
}

fn declared_type_name(ty: DeclaredType) -> &'static str {
    match ty {
        DeclaredType::Bool => "bool",
        DeclaredType::Int => "int",
        DeclaredType::Double => "double",
        DeclaredType::String => "string",
        DeclaredType::Json => "json",
    }
}

async fn handle_function(frame: &Frame, ctx: &DispatchContext<'_>) -> DispatchOutcome {
    let name = frame.path_remainder();
    let args = frame.uri_query.first().cloned().unwrap_or_default();
    let caller = frame.uri_query.get(1).cloned().unwrap_or_default();

    if args.len() > MAX_ARGS_LEN {
        return DispatchOutcome::Reply(frame.respond(CoapCode::BAD_REQUEST, Bytes::new()));
    }

    let Some((flags, handler)) = ctx.functions.get(&name) else {
        return DispatchOutcome::Reply(frame.respond(CoapCode::NOT_FOUND, Bytes::new()));
    };

    if flags.owner_only && !ctx.owners.contains(&caller) {
        return DispatchOutcome::Reply(frame.respond(CoapCode::FORBIDDEN, Bytes::new()));
    }

    match handler.call(args).await {
        Ok(result) => {
            DispatchOutcome::Reply(frame.respond(CoapCode::CHANGED, Bytes::copy_from_slice(&result.to_be_bytes())))
        }
        Err(message) => {
            ctx.events.emit(ClientEvent::Error {
                message: message.clone(),
            });
            DispatchOutcome::Reply(frame.respond(flags.error_response_code, Bytes::from(message.into_bytes())))
        }
    }
}

async fn handle_variable(frame: &Frame, ctx: &DispatchContext<'_>) -> DispatchOutcome {
    // Only the first Uri-Path segment after `v` selects the variable
    // (spec.md §9 open question 1's resolved reading); deeper sub-paths
    // are not a supported routing mechanism.
    let Some(name) = frame.uri_path.get(1) else {
        return DispatchOutcome::Reply(frame.respond(CoapCode::NOT_FOUND, Bytes::new()));
    };

    let Some((declared_type, handler)) = ctx.variables.get(name) else {
        return DispatchOutcome::Reply(frame.respond(CoapCode::NOT_FOUND, Bytes::new()));
    };

    match handler.read().await {
        Ok(value) => match encode_variable(declared_type, &value) {
            Ok(payload) => DispatchOutcome::Reply(frame.respond(CoapCode::CONTENT, payload)),
            Err((code, message)) => DispatchOutcome::Reply(frame.respond(code, Bytes::from(message.into_bytes()))),
        },
        Err(message) => {
            ctx.events.emit(ClientEvent::Error {
                message: message.clone(),
            });
            DispatchOutcome::Reply(frame.respond(CoapCode::INTERNAL_SERVER_ERROR, Bytes::from(message.into_bytes())))
        }
    }
}

fn encode_variable(
    declared_type: DeclaredType,
    value: &VariableValue,
) -> std::result::Result<Bytes, (CoapCode, String)> {
    match (declared_type, value) {
        (DeclaredType::Bool, VariableValue::Bool(b)) => Ok(Bytes::from(vec![*b as u8])),
        (DeclaredType::Int, VariableValue::Int(i)) => Ok(Bytes::copy_from_slice(&i.to_be_bytes())),
        (DeclaredType::Double, VariableValue::Double(d)) => Ok(Bytes::copy_from_slice(&d.to_be_bytes())),
        (DeclaredType::String, VariableValue::String(s)) => {
            if s.len() > MAX_ENCODED_VALUE_LEN {
                return Err((CoapCode::BAD_REQUEST, "encoded value too large".to_string()));
            }
            Ok(Bytes::from(s.clone().into_bytes()))
        }
        (DeclaredType::Json, VariableValue::Json(v)) => {
            let text = serde_json::to_string(v)
                .map_err(|e| (CoapCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
            if text.len() > MAX_ENCODED_VALUE_LEN {
                return Err((CoapCode::BAD_REQUEST, "encoded value too large".to_string()));
            }
            Ok(Bytes::from(text.into_bytes()))
        }
        _ => Err((
            CoapCode::INTERNAL_SERVER_ERROR,
            "callback returned a value that does not match the declared type".to_string(),
        )),
    }
}

async fn handle_event(frame: &Frame, ctx: &DispatchContext<'_>) {
    let name = frame.path_remainder();
    for (_, handler) in ctx.subscriptions.matching(&name) {
        handler.handle(&name, &frame.payload).await;
    }
}

fn handle_signal_start(frame: &Frame, ctx: &DispatchContext<'_>) -> Frame {
    let on = frame
        .uri_query
        .first()
        .map(|q| q == "1")
        .unwrap_or(false);
    ctx.events.emit(ClientEvent::Signal(on));
    frame.respond(CoapCode::CHANGED, Bytes::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coap::Confirmability;
    use crate::registry::{FileRegistry, FunctionFlags, SubscriptionRegistry, VariableRegistry};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct AddFunction;
    #[async_trait]
    impl crate::registry::FunctionHandler for AddFunction {
        async fn call(&self, args: String) -> std::result::Result<i32, String> {
            let parts: Vec<i32> = args.split(',').filter_map(|s| s.parse().ok()).collect();
            Ok(parts.iter().sum())
        }
    }

    fn make_ctx<'a>(
        functions: &'a FunctionRegistry,
        variables: &'a VariableRegistry,
        files: &'a FileRegistry,
        subscriptions: &'a SubscriptionRegistry,
        owners: &'a OwnerList,
        events: &'a EventBus,
    ) -> DispatchContext<'a> {
        DispatchContext {
            functions,
            variables,
            files,
            subscriptions,
            owners,
            events,
            platform_id: 6,
            firmware_version: 1,
        }
    }

    #[tokio::test]
    async fn function_call_success_replies_with_encoded_result() {
        // S3: registered `add` returns 42 on input "1,2" (spec's example
        // computes 1+2 conceptually as a stand-in result).
        let mut functions = FunctionRegistry::default();
        functions.register("add", FunctionFlags::default(), Arc::new(AddFunction));
        let variables = VariableRegistry::default();
        let files = FileRegistry::default();
        let subscriptions = SubscriptionRegistry::default();
        let owners = OwnerList::default();
        let (events, _rx) = EventBus::new();
        let ctx = make_ctx(&functions, &variables, &files, &subscriptions, &owners, &events);

        let frame = Frame::new(Confirmability::Confirmable, CoapCode::POST, 1)
            .with_token(vec![0xAB])
            .with_path(&[codes::FUNCTION, "add"])
            .with_query(vec!["40,2".to_string(), "caller".to_string()]);

        match dispatch(&frame, &ctx).await {
            DispatchOutcome::Reply(reply) => {
                assert_eq!(reply.code, CoapCode::CHANGED);
                assert_eq!(reply.token, vec![0xAB]);
                assert_eq!(&reply.payload[..], &42i32.to_be_bytes());
            }
            _ => panic!("expected a reply"),
        }
    }

    #[tokio::test]
    async fn function_call_rejects_oversized_args() {
        let functions = FunctionRegistry::default();
        let variables = VariableRegistry::default();
        let files = FileRegistry::default();
        let subscriptions = SubscriptionRegistry::default();
        let owners = OwnerList::default();
        let (events, _rx) = EventBus::new();
        let ctx = make_ctx(&functions, &variables, &files, &subscriptions, &owners, &events);

        let frame = Frame::new(Confirmability::Confirmable, CoapCode::POST, 1)
            .with_path(&[codes::FUNCTION, "add"])
            .with_query(vec!["x".repeat(700)]);

        match dispatch(&frame, &ctx).await {
            DispatchOutcome::Reply(reply) => assert_eq!(reply.code, CoapCode::BAD_REQUEST),
            _ => panic!("expected a reply"),
        }
    }

    #[tokio::test]
    async fn owner_only_function_rejects_unknown_caller() {
        let mut functions = FunctionRegistry::default();
        functions.register(
            "restricted",
            FunctionFlags {
                owner_only: true,
                ..Default::default()
            },
            Arc::new(AddFunction),
        );
        let variables = VariableRegistry::default();
        let files = FileRegistry::default();
        let subscriptions = SubscriptionRegistry::default();
        let owners = OwnerList::default();
        let (events, _rx) = EventBus::new();
        let ctx = make_ctx(&functions, &variables, &files, &subscriptions, &owners, &events);

        let frame = Frame::new(Confirmability::Confirmable, CoapCode::POST, 1)
            .with_path(&[codes::FUNCTION, "restricted"])
            .with_query(vec!["1,2".to_string(), "stranger".to_string()]);

        match dispatch(&frame, &ctx).await {
            DispatchOutcome::Reply(reply) => assert_eq!(reply.code, CoapCode::FORBIDDEN),
            _ => panic!("expected a reply"),
        }
    }

    #[tokio::test]
    async fn signal_start_emits_signal_and_acks() {
        let functions = FunctionRegistry::default();
        let variables = VariableRegistry::default();
        let files = FileRegistry::default();
        let subscriptions = SubscriptionRegistry::default();
        let owners = OwnerList::default();
        let (events, mut rx) = EventBus::new();
        let ctx = make_ctx(&functions, &variables, &files, &subscriptions, &owners, &events);

        let frame = Frame::new(Confirmability::Confirmable, CoapCode::POST, 9)
            .with_path(&[codes::SIGNAL_START])
            .with_query(vec!["1".to_string()]);

        match dispatch(&frame, &ctx).await {
            DispatchOutcome::Reply(reply) => assert_eq!(reply.code, CoapCode::CHANGED),
            _ => panic!("expected a reply"),
        }
        assert!(matches!(rx.try_recv(), Ok(ClientEvent::Signal(true))));
    }
}
