/// Declares a `u64` address newtype with the arithmetic used by page math.
macro_rules! impl_ops {
    ($name:ident, $doc:expr) => {
        #[doc = concat!("A ", $doc, ".")]
        #[derive(
            Default,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            ::serde::Serialize,
            ::serde::Deserialize,
        )]
        pub struct $name(pub u64);

        impl $name {
            #[doc = concat!("Creates a new `", stringify!($name), "`.")]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> u64 {
                value.0
            }
        }

        impl_ops!(@binary $name, Add, add, AddAssign, add_assign, +);
        impl_ops!(@binary $name, Sub, sub, SubAssign, sub_assign, -);

        impl ::std::ops::BitAnd<u64> for $name {
            type Output = $name;

            fn bitand(self, rhs: u64) -> Self::Output {
                Self(self.0 & rhs)
            }
        }

        impl ::std::ops::BitOr<u64> for $name {
            type Output = $name;

            fn bitor(self, rhs: u64) -> Self::Output {
                Self(self.0 | rhs)
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                write!(f, "0x{:016x}", self.0)
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                write!(f, "0x{:016x}", self.0)
            }
        }

        impl ::std::fmt::LowerHex for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                ::std::fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };

    (@binary $name:ident, $op:ident, $method:ident, $op_assign:ident, $method_assign:ident, $tok:tt) => {
        impl ::std::ops::$op<u64> for $name {
            type Output = $name;

            fn $method(self, rhs: u64) -> Self::Output {
                Self(self.0 $tok rhs)
            }
        }

        impl ::std::ops::$op<$name> for $name {
            type Output = $name;

            fn $method(self, rhs: $name) -> Self::Output {
                Self(self.0 $tok rhs.0)
            }
        }

        impl ::std::ops::$op_assign<u64> for $name {
            fn $method_assign(&mut self, rhs: u64) {
                *self = Self(self.0 $tok rhs);
            }
        }
    };
}

pub(crate) use impl_ops;
