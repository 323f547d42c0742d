//! Constructors for the envelope variants, and the validation pass a
//! message loop runs on every inbound envelope before dispatching it.
//!
//! Grounded on the constructor-function style of `srpc::packet`, adapted to
//! build [`Envelope`] instead of `Packet` and to carry a `Cid` rather than a
//! bare stream id.

use crate::context::Cid;
use crate::error::{Error, Result};
use crate::proto::{
    envelope::Body, CallRequest, Cancel, ContextId, Envelope, ErrorValue, FunctionsQuery,
    FunctionsReply, Handshake, ReturnValue, Stop, StructValue, Value, YieldValue,
};

fn cid_to_wire(cid: &Cid) -> ContextId {
    ContextId {
        caller_name: cid.caller_name.clone(),
        caller_instance: cid.caller_instance.clone(),
        conversation_id: cid.conversation_id.clone(),
    }
}

fn cid_from_wire(cid: &ContextId) -> Cid {
    Cid {
        caller_name: cid.caller_name.clone(),
        caller_instance: cid.caller_instance.clone(),
        conversation_id: cid.conversation_id.clone(),
    }
}

pub fn handshake(name: impl Into<String>, instance_id: impl Into<String>) -> Envelope {
    Envelope {
        body: Some(Body::Handshake(Handshake {
            name: name.into(),
            instance_id: instance_id.into(),
        })),
    }
}

pub fn call(cid: &Cid, ns: impl Into<String>, func: impl Into<String>, kwargs: StructValue) -> Envelope {
    Envelope {
        body: Some(Body::Call(CallRequest {
            cid: Some(cid_to_wire(cid)),
            ns: ns.into(),
            func: func.into(),
            kwargs: Some(kwargs),
        })),
    }
}

pub fn return_value(cid: &Cid, value: Value) -> Envelope {
    Envelope {
        body: Some(Body::ReturnValue(ReturnValue {
            cid: Some(cid_to_wire(cid)),
            value: Some(value),
        })),
    }
}

pub fn yield_value(cid: &Cid, value: Value) -> Envelope {
    Envelope {
        body: Some(Body::YieldValue(YieldValue {
            cid: Some(cid_to_wire(cid)),
            value: Some(value),
        })),
    }
}

pub fn stop(cid: &Cid) -> Envelope {
    Envelope {
        body: Some(Body::Stop(Stop { cid: Some(cid_to_wire(cid)) })),
    }
}

pub fn error_value(cid: &Cid, kind: impl Into<String>, message: impl Into<String>, traceback: impl Into<String>) -> Envelope {
    Envelope {
        body: Some(Body::Error(ErrorValue {
            cid: Some(cid_to_wire(cid)),
            kind: kind.into(),
            message: message.into(),
            traceback: traceback.into(),
        })),
    }
}

pub fn cancel(cid: &Cid) -> Envelope {
    Envelope {
        body: Some(Body::Cancel(Cancel { cid: Some(cid_to_wire(cid)) })),
    }
}

pub fn functions_query(cid: &Cid, ns: impl Into<String>) -> Envelope {
    Envelope {
        body: Some(Body::FunctionsQuery(FunctionsQuery {
            cid: Some(cid_to_wire(cid)),
            ns: ns.into(),
        })),
    }
}

pub fn functions_reply(cid: &Cid, names: Vec<String>) -> Envelope {
    Envelope {
        body: Some(Body::FunctionsReply(FunctionsReply {
            cid: Some(cid_to_wire(cid)),
            names,
        })),
    }
}

/// Extract the [`Cid`] carried by any envelope variant that has one.
///
/// Every variant except [`Body::Handshake`] is scoped to a context id; a
/// missing `cid` on those variants is a protocol violation rather than an
/// absent-field default, so this returns an error instead of `None`.
pub fn envelope_cid(envelope: &Envelope) -> Result<Option<Cid>> {
    let wire_cid = match &envelope.body {
        Some(Body::Handshake(_)) => return Ok(None),
        Some(Body::Call(c)) => c.cid.as_ref(),
        Some(Body::ReturnValue(c)) => c.cid.as_ref(),
        Some(Body::YieldValue(c)) => c.cid.as_ref(),
        Some(Body::Stop(c)) => c.cid.as_ref(),
        Some(Body::Error(c)) => c.cid.as_ref(),
        Some(Body::Cancel(c)) => c.cid.as_ref(),
        Some(Body::FunctionsQuery(c)) => c.cid.as_ref(),
        Some(Body::FunctionsReply(c)) => c.cid.as_ref(),
        None => return Err(Error::InvalidEnvelope("envelope with no body".into())),
    };
    match wire_cid {
        Some(c) => Ok(Some(cid_from_wire(c))),
        None => Err(Error::InvalidEnvelope("envelope missing context id".into())),
    }
}
