//! Runtime side of the resource meter
//!
//! Generated code performs the same check inline at function entries and loop
//! headers against `VMContext::fuel_remaining`; this is the host-side version
//! used by `memory.grow` and by host intrinsics.

/// Deduct `amount` from `remaining`.
///
/// Returns false, leaving `remaining` at zero, when the balance would go
/// negative. The caller must then end the execution as budget exhausted.
pub fn charge(remaining: &mut u64, amount: u64) -> bool {
    match remaining.checked_sub(amount) {
        Some(left) => {
            *remaining = left;
            true
        }
        None => {
            *remaining = 0;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_balance_is_spendable() {
        let mut remaining = 10;
        assert!(charge(&mut remaining, 10));
        assert_eq!(remaining, 0);
        assert!(charge(&mut remaining, 0));
    }

    #[test]
    fn test_overdraft_drains_the_budget() {
        let mut remaining = 9;
        assert!(!charge(&mut remaining, 10));
        assert_eq!(remaining, 0);
    }
}
