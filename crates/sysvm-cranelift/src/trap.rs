//! Trap codes written into the VM context by generated code

use derive_more::Display;

/// Reason an execution stopped before returning normally.
///
/// Generated code stores the raw value in `VMContext::trap_code` and unwinds
/// by returning from every active frame. Zero means no trap.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TrapCode {
    #[display("out of bounds memory access")]
    HeapOutOfBounds = 1,
    #[display("undefined element: out of bounds table access")]
    TableOutOfBounds = 2,
    #[display("uninitialized element in indirect call")]
    IndirectCallToNull = 3,
    #[display("indirect call type mismatch")]
    BadSignature = 4,
    #[display("integer divide by zero")]
    IntegerDivisionByZero = 5,
    #[display("integer overflow")]
    IntegerOverflow = 6,
    #[display("invalid conversion to integer")]
    BadConversionToInteger = 7,
    #[display("unreachable executed")]
    Unreachable = 8,
    #[display("call stack exhausted")]
    CallStackExhausted = 9,

    // Exit codes that are not contract traps
    #[display("budget exhausted")]
    BudgetExhausted = 64,
    #[display("aborted by host")]
    HostAbort = 65,
    #[display("engine resource exhausted")]
    EngineResource = 66,
}

impl TrapCode {
    pub const NONE: u32 = 0;

    pub fn as_raw(self) -> u32 {
        self as u32
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => TrapCode::HeapOutOfBounds,
            2 => TrapCode::TableOutOfBounds,
            3 => TrapCode::IndirectCallToNull,
            4 => TrapCode::BadSignature,
            5 => TrapCode::IntegerDivisionByZero,
            6 => TrapCode::IntegerOverflow,
            7 => TrapCode::BadConversionToInteger,
            8 => TrapCode::Unreachable,
            9 => TrapCode::CallStackExhausted,
            64 => TrapCode::BudgetExhausted,
            65 => TrapCode::HostAbort,
            66 => TrapCode::EngineResource,
            _ => return None,
        })
    }

    /// Whether this code is a safety trap raised by the contract itself
    pub fn is_contract_trap(self) -> bool {
        self.as_raw() < TrapCode::BudgetExhausted.as_raw()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_codes_round_trip() {
        for code in [
            TrapCode::HeapOutOfBounds,
            TrapCode::CallStackExhausted,
            TrapCode::BudgetExhausted,
            TrapCode::EngineResource,
        ] {
            assert_eq!(TrapCode::from_raw(code.as_raw()), Some(code));
        }
        assert_eq!(TrapCode::from_raw(TrapCode::NONE), None);
    }

    #[test]
    fn test_exit_codes_are_not_contract_traps() {
        assert!(TrapCode::Unreachable.is_contract_trap());
        assert!(!TrapCode::BudgetExhausted.is_contract_trap());
        assert!(!TrapCode::HostAbort.is_contract_trap());
    }
}
