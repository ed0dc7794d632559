//! Positional argument lists.

use stratus_core::{CodecError, WireValue};

use crate::value::{TypeDescriptor, WireType};

/// An ordered argument list, implemented for tuples of [`WireType`]s.
///
/// Decoding checks the argument count before touching any value, so a
/// wrong arity never yields a partially decoded list.
pub trait Params: Sized + Send + 'static {
    /// Number of parameters.
    const ARITY: usize;

    /// Declared parameter types, in order.
    fn descriptors() -> Vec<TypeDescriptor>;

    fn into_wire(self) -> Result<Vec<WireValue>, CodecError>;

    fn from_wire(values: Vec<WireValue>) -> Result<Self, CodecError>;
}

/// Fail with "expected N but got M" unless `got` matches `expected`.
pub fn check_arity(expected: usize, got: usize) -> Result<(), CodecError> {
    if expected == got {
        Ok(())
    } else {
        Err(CodecError::ArityMismatch { expected, got })
    }
}

macro_rules! impl_params {
    ($arity:literal; $($ty:ident $var:ident),*) => {
        impl<$($ty: WireType),*> Params for ($($ty,)*) {
            const ARITY: usize = $arity;

            fn descriptors() -> Vec<TypeDescriptor> {
                vec![$($ty::descriptor()),*]
            }

            fn into_wire(self) -> Result<Vec<WireValue>, CodecError> {
                let ($($var,)*) = self;
                Ok(vec![$($var.into_wire()?),*])
            }

            #[allow(unused_mut, unused_variables)]
            fn from_wire(values: Vec<WireValue>) -> Result<Self, CodecError> {
                check_arity(Self::ARITY, values.len())?;
                let mut values = values.into_iter();
                Ok(($(
                    $ty::from_wire(values.next().ok_or(CodecError::ArityMismatch {
                        expected: $arity,
                        got: 0,
                    })?)?,
                )*))
            }
        }
    };
}

impl_params!(0;);
impl_params!(1; A a);
impl_params!(2; A a, B b);
impl_params!(3; A a, B b, C c);
impl_params!(4; A a, B b, C c, D d);
impl_params!(5; A a, B b, C c, D d, E e);
impl_params!(6; A a, B b, C c, D d, E e, F f);
impl_params!(7; A a, B b, C c, D d, E e, F f, G g);
impl_params!(8; A a, B b, C c, D d, E e, F f, G g, H h);
