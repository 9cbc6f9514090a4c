use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Type tags of values crossing the bridge, numbered like the VM's
/// `BasicType` so they can be passed to and returned from runtime calls as
/// plain integers.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum BasicType {
    Boolean = 4,
    Char = 5,
    Float = 6,
    Double = 7,
    Byte = 8,
    Short = 9,
    Int = 10,
    Long = 11,
    Object = 12,
    Array = 13,
    Void = 14,
    Address = 15,
    NarrowOop = 16,
    Conflict = 17,
}

impl BasicType {
    /// Size in 4-byte words, 2 for longs and doubles; `Void` occupies no
    /// space of its own (it marks the upper half of a long/double).
    pub fn size(self) -> i32 {
        match self {
            BasicType::Long | BasicType::Double => 2,
            BasicType::Void => 0,
            _ => 1,
        }
    }

    pub fn is_int_like(self) -> bool {
        matches!(
            self,
            BasicType::Boolean
                | BasicType::Char
                | BasicType::Byte
                | BasicType::Short
                | BasicType::Int
        )
    }

    pub fn is_reference(self) -> bool {
        matches!(self, BasicType::Object | BasicType::Array)
    }

    pub fn is_two_word(self) -> bool {
        matches!(self, BasicType::Long | BasicType::Double)
    }

    /// Expands a method's parameter types into the per-slot signature used
    /// by the calling conventions: every long/double is followed by `Void`,
    /// and a non-static method gets its receiver first.
    pub fn expand_signature(params: &[BasicType], is_static: bool) -> Vec<BasicType> {
        let mut sig = Vec::with_capacity(params.len() * 2 + 1);

        if !is_static {
            sig.push(BasicType::Object);
        }

        for &ty in params {
            sig.push(ty);

            if ty.is_two_word() {
                sig.push(BasicType::Void);
            }
        }

        sig
    }
}
