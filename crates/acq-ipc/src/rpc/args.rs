//! Typed argument tuples.
//!
//! Methods take a tuple of zero to four arguments. Each element travels as
//! its own bincode blob, so the server can report exactly which argument
//! failed to decode.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::envelope::ArgValue;

/// Why an argument list could not be decoded.
#[derive(Debug)]
pub enum ArgDecodeError {
    /// The number of arguments differs from the parameter count.
    Arity {
        /// Parameters declared by the method.
        expected: usize,
        /// Arguments received.
        actual: usize,
    },
    /// Argument `index` did not decode to its parameter type.
    Argument {
        /// Zero-based argument position.
        index: usize,
        /// Decoder failure.
        source: bincode::Error,
    },
}

/// A tuple usable as a method's argument list.
pub trait ArgTuple: Sized {
    /// Number of elements.
    const ARITY: usize;

    /// Rust type names of the elements, in order.
    fn type_names() -> Vec<&'static str>;

    /// Serialize each element into its own blob.
    fn encode(&self) -> Result<Vec<Vec<u8>>, bincode::Error>;

    /// Decode from received arguments, checking arity first.
    fn decode(args: &[ArgValue]) -> Result<Self, ArgDecodeError>;
}

fn decode_one<T: DeserializeOwned>(args: &[ArgValue], index: usize) -> Result<T, ArgDecodeError> {
    let arg = args.get(index).ok_or(ArgDecodeError::Arity {
        expected: index + 1,
        actual: args.len(),
    })?;
    bincode::deserialize(&arg.value).map_err(|source| ArgDecodeError::Argument { index, source })
}

impl ArgTuple for () {
    const ARITY: usize = 0;

    fn type_names() -> Vec<&'static str> {
        Vec::new()
    }

    fn encode(&self) -> Result<Vec<Vec<u8>>, bincode::Error> {
        Ok(Vec::new())
    }

    fn decode(args: &[ArgValue]) -> Result<Self, ArgDecodeError> {
        if args.is_empty() {
            Ok(())
        } else {
            Err(ArgDecodeError::Arity {
                expected: 0,
                actual: args.len(),
            })
        }
    }
}

macro_rules! impl_arg_tuple {
    ($arity:expr; $($name:ident : $idx:tt),+) => {
        impl<$($name),+> ArgTuple for ($($name,)+)
        where
            $($name: Serialize + DeserializeOwned + 'static),+
        {
            const ARITY: usize = $arity;

            fn type_names() -> Vec<&'static str> {
                vec![$(std::any::type_name::<$name>()),+]
            }

            fn encode(&self) -> Result<Vec<Vec<u8>>, bincode::Error> {
                Ok(vec![$(bincode::serialize(&self.$idx)?),+])
            }

            fn decode(args: &[ArgValue]) -> Result<Self, ArgDecodeError> {
                if args.len() != Self::ARITY {
                    return Err(ArgDecodeError::Arity {
                        expected: Self::ARITY,
                        actual: args.len(),
                    });
                }
                Ok(($(decode_one::<$name>(args, $idx)?,)+))
            }
        }
    };
}

impl_arg_tuple!(1; A: 0);
impl_arg_tuple!(2; A: 0, B: 1);
impl_arg_tuple!(3; A: 0, B: 1, C: 2);
impl_arg_tuple!(4; A: 0, B: 1, C: 2, D: 3);
