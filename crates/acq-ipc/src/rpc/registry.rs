//! Explicit method registry.
//!
//! A registry is built once per interface type by composing capability
//! registration functions, each adding the methods of one capability trait.
//! Dispatch resolves a call by name across every registered capability, so a
//! name declared by two different capabilities is ambiguous and rejected, the
//! same way a missing name is.
//!
//! The same registration code yields the [`InterfaceSignature`] that clients
//! check their calls against in debug builds.

use acq_core::{AcqResult, ErrorKind};
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};

use super::args::{ArgDecodeError, ArgTuple};
use super::envelope::{ArgValue, CallEnvelope, ReturnEnvelope};
use super::error::RpcError;

/// Name and type of one parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSignature {
    /// Parameter name.
    pub name: String,
    /// Rust type name.
    pub type_name: &'static str,
}

/// Declaration of one dispatchable method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    /// Capability that declared the method.
    pub origin: &'static str,
    /// Method name.
    pub name: &'static str,
    /// Parameters in order.
    pub params: Vec<ParamSignature>,
    /// Rust type name of the return value.
    pub returns: &'static str,
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| format!("{}: {}", p.name, p.type_name))
            .collect();
        write!(
            f,
            "{}::{}({}) -> {}",
            self.origin,
            self.name,
            params.join(", "),
            self.returns
        )
    }
}

/// Every method of an interface, across all of its capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceSignature {
    methods: Vec<MethodSignature>,
}

impl InterfaceSignature {
    /// All declared methods, in registration order.
    #[must_use]
    pub fn methods(&self) -> &[MethodSignature] {
        &self.methods
    }

    /// The single method named `name`.
    pub fn resolve(&self, name: &str) -> Result<&MethodSignature, String> {
        self.position(name).map(|index| &self.methods[index])
    }

    fn position(&self, name: &str) -> Result<usize, String> {
        let mut found = self
            .methods
            .iter()
            .enumerate()
            .filter(|(_, m)| m.name == name)
            .map(|(index, _)| index);
        match (found.next(), found.next()) {
            (None, _) => Err(format!("RPC function name not found: {name}")),
            (Some(index), None) => Ok(index),
            (Some(_), Some(_)) => Err(format!("More than one method found with name {name}")),
        }
    }

    /// Confirm that a call with these argument and return types matches
    /// exactly one declared method.
    pub fn check(
        &self,
        name: &str,
        arg_types: &[&str],
        returns: &str,
    ) -> Result<&MethodSignature, RpcError> {
        let method = self.resolve(name).map_err(RpcError::SignatureMismatch)?;
        if method.params.len() != arg_types.len() {
            return Err(RpcError::SignatureMismatch(format!(
                "{method} takes {} arguments, call passes {}",
                method.params.len(),
                arg_types.len()
            )));
        }
        for (index, (param, actual)) in method.params.iter().zip(arg_types).enumerate() {
            if param.type_name != *actual {
                return Err(RpcError::SignatureMismatch(format!(
                    "argument #{index} of {method} is {}, call passes {actual}",
                    param.type_name
                )));
            }
        }
        if method.returns != returns {
            return Err(RpcError::SignatureMismatch(format!(
                "{method} returns {}, call expects {returns}",
                method.returns
            )));
        }
        Ok(method)
    }
}

type Handler<I> = Box<dyn Fn(&I, &[ArgValue]) -> ReturnEnvelope + Send + Sync>;

/// Dispatch table for an interface `I`.
pub struct MethodRegistry<I: ?Sized> {
    signature: InterfaceSignature,
    handlers: Vec<Handler<I>>,
}

impl<I: ?Sized + 'static> MethodRegistry<I> {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            signature: InterfaceSignature::default(),
            handlers: Vec::new(),
        }
    }

    /// Start registering the methods of capability `origin`.
    pub fn capability(&mut self, origin: &'static str) -> CapabilityBuilder<'_, I> {
        CapabilityBuilder {
            registry: self,
            origin,
        }
    }

    /// Signature of everything registered so far.
    #[must_use]
    pub fn signature(&self) -> &InterfaceSignature {
        &self.signature
    }

    /// Drop the handlers and keep the signature.
    #[must_use]
    pub fn into_signature(self) -> InterfaceSignature {
        self.signature
    }

    /// Resolve and invoke `call` on `target`.
    ///
    /// Never fails: resolution and decoding problems become protocol errors,
    /// implementation errors and panics become remote exceptions.
    pub fn dispatch(&self, call: &CallEnvelope, target: &I) -> ReturnEnvelope {
        let index = match self.signature.position(&call.method) {
            Ok(index) => index,
            Err(message) => {
                warn!(method = %call.method, "{message}");
                return ReturnEnvelope::protocol_error(message);
            }
        };
        let method = &self.signature.methods[index];
        if call.args.len() != method.params.len() {
            return ReturnEnvelope::protocol_error(format!(
                "Argument count mismatch for {}: expected {}, received {}",
                method.name,
                method.params.len(),
                call.args.len()
            ));
        }
        for (index, (arg, param)) in call.args.iter().zip(&method.params).enumerate() {
            if let Some(decl) = &arg.decl {
                if decl.type_name != param.type_name {
                    return ReturnEnvelope::protocol_error(format!(
                        "Argument #{index} of {} declared as {} but parameter {} is {}",
                        method.name, decl.type_name, param.name, param.type_name
                    ));
                }
            }
        }
        let Some(handler) = self.handlers.get(index) else {
            return ReturnEnvelope::protocol_error(format!(
                "RPC function name not found: {}",
                call.method
            ));
        };
        debug!(method = %call.method, "dispatching");
        match catch_unwind(AssertUnwindSafe(|| handler(target, &call.args))) {
            Ok(ret) => ret,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(method = %call.method, panic = %message, "remote method panicked");
                ReturnEnvelope::remote_exception(
                    ErrorKind::Unknown,
                    format!("{} panicked: {message}", call.method),
                )
            }
        }
    }
}

impl<I: ?Sized + 'static> Default for MethodRegistry<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: ?Sized> fmt::Debug for MethodRegistry<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("signature", &self.signature)
            .finish()
    }
}

/// Adds the methods of one capability to a registry.
pub struct CapabilityBuilder<'a, I: ?Sized> {
    registry: &'a mut MethodRegistry<I>,
    origin: &'static str,
}

impl<I: ?Sized + 'static> CapabilityBuilder<'_, I> {
    /// Register `name` with parameter names `params`.
    ///
    /// Registering the same capability twice (e.g. two capabilities that
    /// both extend `StartStop`) keeps the first registration.
    #[must_use]
    pub fn method<A, R, F>(self, name: &'static str, params: &[&str], handler: F) -> Self
    where
        A: ArgTuple + 'static,
        R: Serialize + 'static,
        F: Fn(&I, A) -> AcqResult<R> + Send + Sync + 'static,
    {
        let duplicate = self
            .registry
            .signature
            .methods
            .iter()
            .any(|m| m.origin == self.origin && m.name == name);
        if duplicate {
            return self;
        }
        let params = A::type_names()
            .into_iter()
            .enumerate()
            .map(|(index, type_name)| ParamSignature {
                name: params
                    .get(index)
                    .map_or_else(|| format!("arg{index}"), |p| (*p).to_string()),
                type_name,
            })
            .collect();
        self.registry.signature.methods.push(MethodSignature {
            origin: self.origin,
            name,
            params,
            returns: std::any::type_name::<R>(),
        });
        self.registry
            .handlers
            .push(Box::new(move |target: &I, args: &[ArgValue]| {
                let decoded = match A::decode(args) {
                    Ok(decoded) => decoded,
                    Err(ArgDecodeError::Arity { expected, actual }) => {
                        return ReturnEnvelope::protocol_error(format!(
                            "Argument count mismatch for {name}: expected {expected}, received {actual}"
                        ))
                    }
                    Err(ArgDecodeError::Argument { index, source }) => {
                        return ReturnEnvelope::protocol_error(format!(
                            "Unable to deserialize argument #{index} of {name}: {source}"
                        ))
                    }
                };
                match handler(target, decoded) {
                    Ok(value) => match bincode::serialize(&value) {
                        Ok(bytes) => ReturnEnvelope::ok(bytes),
                        Err(e) => ReturnEnvelope::remote_exception(
                            ErrorKind::Protocol,
                            format!("Unable to serialize the return value of {name}: {e}"),
                        ),
                    },
                    Err(err) => {
                        debug!(method = name, error = %err, "remote method failed");
                        ReturnEnvelope::remote_exception(err.kind(), err.to_string())
                    }
                }
            }));
        self
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::envelope::{ArgDecl, ReturnStatus};
    use acq_core::AcqError;
    use std::sync::atomic::{AtomicI32, Ordering};

    #[derive(Default)]
    struct Dial {
        value: AtomicI32,
    }

    fn dial_registry() -> MethodRegistry<Dial> {
        let mut registry = MethodRegistry::new();
        let _ = registry
            .capability("Dial")
            .method("get", &[], |d: &Dial, (): ()| {
                Ok(d.value.load(Ordering::SeqCst))
            })
            .method("set", &["value"], |d: &Dial, (v,): (i32,)| {
                if v < 0 {
                    return Err(AcqError::InvalidArgument(format!("{v} is negative")));
                }
                d.value.store(v, Ordering::SeqCst);
                Ok(())
            })
            .method("boom", &[], |_: &Dial, (): ()| -> AcqResult<()> {
                panic!("dial exploded")
            });
        registry
    }

    fn call<A: ArgTuple>(method: &str, args: A) -> CallEnvelope {
        CallEnvelope {
            method: method.to_string(),
            args: args
                .encode()
                .unwrap()
                .into_iter()
                .map(|value| ArgValue { decl: None, value })
                .collect(),
        }
    }

    #[test]
    fn test_dispatch_ok_and_unit_return_is_empty() {
        let registry = dial_registry();
        let dial = Dial::default();
        let ret = registry.dispatch(&call("set", (5i32,)), &dial);
        assert_eq!(ret.status, ReturnStatus::Ok);
        assert!(ret.value.is_empty());
        let ret = registry.dispatch(&call("get", ()), &dial);
        assert_eq!(bincode::deserialize::<i32>(&ret.value).unwrap(), 5);
    }

    #[test]
    fn test_unknown_method_is_protocol_error() {
        let ret = dial_registry().dispatch(&call("spin", ()), &Dial::default());
        assert_eq!(ret.status, ReturnStatus::ProtocolError);
        assert!(ret.error.unwrap().message.contains("RPC function name not found"));
    }

    #[test]
    fn test_arity_mismatch_is_protocol_error() {
        let ret = dial_registry().dispatch(&call("set", (1i32, 2i32)), &Dial::default());
        assert_eq!(ret.status, ReturnStatus::ProtocolError);
    }

    #[test]
    fn test_undecodable_argument_names_index() {
        let mut envelope = call("set", (1i32,));
        envelope.args[0].value = vec![1];
        let ret = dial_registry().dispatch(&envelope, &Dial::default());
        assert_eq!(ret.status, ReturnStatus::ProtocolError);
        assert!(ret.error.unwrap().message.contains("argument #0"));
    }

    #[test]
    fn test_declared_type_mismatch_rejected() {
        let mut envelope = call("set", (1i32,));
        envelope.args[0].decl = Some(ArgDecl {
            name: "value".into(),
            type_name: "u64".into(),
        });
        let ret = dial_registry().dispatch(&envelope, &Dial::default());
        assert_eq!(ret.status, ReturnStatus::ProtocolError);
    }

    #[test]
    fn test_implementation_error_keeps_kind() {
        let dial = Dial::default();
        let ret = dial_registry().dispatch(&call("set", (-1i32,)), &dial);
        assert_eq!(ret.status, ReturnStatus::RemoteException);
        assert_eq!(ret.error.unwrap().kind, ErrorKind::InvalidArgument);
        assert_eq!(dial.value.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panic_becomes_remote_exception() {
        let ret = dial_registry().dispatch(&call("boom", ()), &Dial::default());
        assert_eq!(ret.status, ReturnStatus::RemoteException);
        assert!(ret.error.unwrap().message.contains("dial exploded"));
    }

    #[test]
    fn test_same_name_from_two_capabilities_is_ambiguous() {
        let mut registry = dial_registry();
        let _ = registry
            .capability("Other")
            .method("get", &[], |_: &Dial, (): ()| Ok(0i32));
        let ret = registry.dispatch(&call("get", ()), &Dial::default());
        assert_eq!(ret.status, ReturnStatus::ProtocolError);
        assert!(ret
            .error
            .unwrap()
            .message
            .contains("More than one method found with name get"));
    }

    #[test]
    fn test_repeated_capability_registration_is_deduplicated() {
        let mut registry = dial_registry();
        let _ = registry
            .capability("Dial")
            .method("get", &[], |_: &Dial, (): ()| Ok(0i32));
        assert_eq!(registry.signature().methods().len(), 3);
    }

    #[test]
    fn test_signature_check() {
        let registry = dial_registry();
        let sig = registry.signature();
        assert!(sig.check("set", &["i32"], "()").is_ok());
        assert!(sig.check("set", &["u8"], "()").is_err());
        assert!(sig.check("set", &[], "()").is_err());
        assert!(sig.check("get", &[], "u64").is_err());
        assert!(sig.check("nope", &[], "()").is_err());
    }
}
