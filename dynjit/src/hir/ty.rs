//! HIR types: a lattice of bitsets.
//!
//! Each bit is a disjoint set of values. A type is the union of its bits, so subtyping is subset
//! inclusion and joins are bitwise or.

use std::{
    fmt,
    ops::{BitAnd, BitOr},
};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Type(u32);

macro_rules! bits {
    ($($name:ident = $bit:expr),* $(,)?) => {
        #[allow(non_upper_case_globals)]
        impl Type {
            $(pub const $name: Type = Type(1 << $bit);)*
        }

        const BASIC: &[(Type, &str)] = &[$((Type::$name, stringify!($name))),*];
    };
}

bits! {
    NoneType = 0,
    Bool = 1,
    LongExact = 2,
    FloatExact = 3,
    UnicodeExact = 4,
    TupleExact = 5,
    ListExact = 6,
    OtherObject = 7,
    Nullptr = 8,
    CBool = 9,
    CInt8 = 10,
    CInt16 = 11,
    CInt32 = 12,
    CInt64 = 13,
    CUInt8 = 14,
    CUInt16 = 15,
    CUInt32 = 16,
    CUInt64 = 17,
    CDouble = 18,
}

#[allow(non_upper_case_globals)]
impl Type {
    pub const Bottom: Type = Type(0);
    pub const Object: Type = Type((1 << 8) - 1);
    pub const OptObject: Type = Type(Type::Object.0 | Type::Nullptr.0);
    pub const CInt: Type = Type(
        Type::CInt8.0 | Type::CInt16.0 | Type::CInt32.0 | Type::CInt64.0,
    );
    pub const CUInt: Type = Type(
        Type::CUInt8.0 | Type::CUInt16.0 | Type::CUInt32.0 | Type::CUInt64.0,
    );
    pub const Top: Type = Type((1 << 19) - 1);

    /// Is `self` a subtype of `other`?
    pub fn le(self, other: Type) -> bool {
        self.0 & !other.0 == 0
    }

    /// Do `self` and `other` have any values in common?
    pub fn could_be(self, other: Type) -> bool {
        self.0 & other.0 != 0
    }

    /// Is every value of this type a managed object?
    pub fn is_object(self) -> bool {
        self != Type::Bottom && self.le(Type::Object)
    }

    /// Is every value of this type an unboxed machine value?
    pub fn is_primitive(self) -> bool {
        self != Type::Bottom
            && self.le(Type(
                Type::CBool.0 | Type::CInt.0 | Type::CUInt.0 | Type::CDouble.0,
            ))
    }
}

impl BitOr for Type {
    type Output = Type;
    fn bitor(self, rhs: Type) -> Type {
        Type(self.0 | rhs.0)
    }
}

impl BitAnd for Type {
    type Output = Type;
    fn bitand(self, rhs: Type) -> Type {
        Type(self.0 & rhs.0)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMED: &[(Type, &str)] = &[
            (Type::Top, "Top"),
            (Type::Bottom, "Bottom"),
            (Type::Object, "Object"),
            (Type::OptObject, "OptObject"),
            (Type::CInt, "CInt"),
            (Type::CUInt, "CUInt"),
        ];
        if let Some((_, n)) = NAMED.iter().find(|(t, _)| t == self) {
            return write!(f, "{n}");
        }
        // Print the largest named unions first so that e.g. Object|Nullptr prints compactly.
        let mut rest = self.0;
        let mut parts = Vec::new();
        for (t, n) in NAMED[2..].iter().chain(BASIC.iter()) {
            if t.0 != 0 && rest & t.0 == t.0 {
                parts.push(*n);
                rest &= !t.0;
            }
        }
        write!(f, "{}", parts.join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lattice() {
        assert!(Type::LongExact.le(Type::Object));
        assert!(!Type::Nullptr.le(Type::Object));
        assert!(Type::Object.le(Type::OptObject));
        assert!(Type::OptObject.could_be(Type::Nullptr));
        assert!(Type::CInt32.le(Type::CInt));
        assert!((Type::LongExact | Type::NoneType).is_object());
        assert!(!Type::OptObject.is_object());
        assert!(Type::CDouble.is_primitive());
        assert!(Type::Bottom.le(Type::CBool));
        assert!(Type::OptObject.le(Type::Top));
    }

    #[test]
    fn display() {
        assert_eq!(Type::Object.to_string(), "Object");
        assert_eq!(Type::LongExact.to_string(), "LongExact");
        assert_eq!((Type::LongExact | Type::Nullptr).to_string(), "LongExact|Nullptr");
        assert_eq!((Type::CInt | Type::Nullptr).to_string(), "CInt|Nullptr");
    }
}
