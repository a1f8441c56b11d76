//! Static cost analysis for the injected meter checks
//!
//! A function is metered at its entry and at every loop header. The charge at
//! a metering point covers the instructions lexically in that body; nested
//! loops are charged separately at their own headers.

use sysvm_core::Instruction;

use crate::config::CostSchedule;

/// Compile-time charges for one function body
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionCosts {
    pub entry: u64,
    /// One charge per `loop`, in order of appearance
    pub loops: Vec<u64>,
}

/// Compute the charges of every metering point of `body`.
pub fn function_costs(body: &[Instruction], schedule: &CostSchedule) -> FunctionCosts {
    // counts[0] is the function body, counts[i + 1] is the i-th loop
    let mut counts: Vec<u64> = vec![0];
    // Open frames, holding the counter index of each loop frame
    let mut frames: Vec<Option<usize>> = Vec::new();
    let mut current = 0;

    for instr in body {
        counts[current] += 1;
        match instr {
            Instruction::Loop(_) => {
                frames.push(Some(counts.len()));
                current = counts.len();
                counts.push(0);
            }
            Instruction::Block(_) | Instruction::If(_) => frames.push(None),
            Instruction::End => {
                if let Some(Some(_)) = frames.pop() {
                    current = frames.iter().rev().find_map(|f| *f).unwrap_or(0);
                }
            }
            _ => {}
        }
    }

    let charge = |base: u64, count: u64| {
        base.saturating_add(schedule.per_instruction.saturating_mul(count))
    };
    FunctionCosts {
        entry: charge(schedule.function_entry, counts[0]),
        loops: counts[1..]
            .iter()
            .map(|&count| charge(schedule.loop_iteration, count))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sysvm_core::{BlockType, IntOp, IntWidth};

    fn schedule() -> CostSchedule {
        CostSchedule {
            function_entry: 100,
            loop_iteration: 10,
            per_instruction: 1,
            memory_grow_page: 0,
        }
    }

    #[test]
    fn test_nested_loops_are_charged_at_their_own_header() {
        use Instruction::*;
        let body = vec![
            I32Const(0),              // fn
            Loop(BlockType::Empty),   // fn
            Block(BlockType::Empty),  // outer loop
            Loop(BlockType::Empty),   // outer loop
            Br(0),                    // inner loop
            End,                      // inner loop
            End,                      // outer loop (block)
            Br(0),                    // outer loop
            End,                      // outer loop
            Drop,                     // fn
            End,                      // fn
        ];
        let costs = function_costs(&body, &schedule());
        assert_eq!(costs.entry, 100 + 4);
        assert_eq!(costs.loops, vec![10 + 5, 10 + 2]);
    }

    #[test]
    fn test_zero_schedule_costs_nothing() {
        let body = vec![Instruction::Int(IntWidth::W32, IntOp::Add), Instruction::End];
        let costs = function_costs(
            &body,
            &CostSchedule {
                function_entry: 0,
                loop_iteration: 0,
                per_instruction: 0,
                memory_grow_page: 0,
            },
        );
        assert_eq!(costs.entry, 0);
        assert!(costs.loops.is_empty());
    }
}
