// tests/integration_tests.rs
// Decoder, classifier, history cursor and call-stack reconstruction

use z80_debugger::debugger::{
    find_call_site, Classifier, Frame, HistoryCursor, Instruction, InstructionClass,
    InterruptHeuristic, LocalValue, Reconstructor, ReturnKind, SpSource, StackOperand,
    VirtualCallStack, Z80Classifier, INTERRUPT, UNKNOWN_CALLER,
};
use z80_debugger::parser::{LabelTable, RegisterSnapshot, SnapshotDecoder};
use z80_debugger::target::{CompletionReason, RunMode, StepKind, Target, TraceTarget, TransportCapability};
use z80_debugger::{DebugError, Result};

// Helper to build a snapshot with the registers that matter here
fn snap(pc: u16, sp: u16) -> RegisterSnapshot {
    RegisterSnapshot {
        pc,
        sp,
        bc: 0x1111,
        hl: 0x2222,
        ..Default::default()
    }
}

fn classify(bytes: &[u8], pc: u16) -> Instruction {
    Z80Classifier.classify(bytes, pc)
}

fn reconstructor() -> Reconstructor {
    let mut labels = LabelTable::new();
    labels.insert("sub", 0x9000);
    labels.insert("print", 0x80D3);
    Reconstructor::new(Box::new(labels), InterruptHeuristic::default())
}

fn depth(stack: &Option<VirtualCallStack>) -> usize {
    stack.as_ref().map_or(0, VirtualCallStack::depth)
}

#[cfg(test)]
mod decoder_tests {
    use super::*;

    const LINE: &str = "PC=80d3 SP=83fb AF=3f08 BC=0000 HL=4000 DE=2000 IX=ffff IY=5c3a AF'=0044 BC'=0001 HL'=f3f3 DE'=0001 I=00 R=0d IM0 IFF12 (PC)=3e020603 (SP)=80f5";

    #[test]
    fn test_decode_full_line() {
        let mut decoder = SnapshotDecoder::new();
        let s = decoder.decode(LINE).expect("line decodes");
        assert_eq!(s.pc, 0x80D3);
        assert_eq!(s.sp, 0x83FB);
        assert_eq!(s.af, 0x3F08);
        assert_eq!(s.flags(), 0x08);
        assert_eq!(s.hl, 0x4000);
        assert_eq!(s.de, 0x2000);
        assert_eq!(s.iy, 0x5C3A);
        assert_eq!(s.af2, 0x0044);
        assert_eq!(s.hl2, 0xF3F3);
        assert_eq!(s.r, 0x0D);
        assert_eq!(s.interrupt_mode, Some(0));
        assert_eq!(s.opcodes, Some([0x3E, 0x02, 0x06, 0x03]));
        assert_eq!(s.sp_content, Some(0x80F5));
        assert!(s.is_live());
    }

    #[test]
    fn test_missing_required_field_is_malformed() {
        let mut decoder = SnapshotDecoder::new();
        let line = LINE.replace("SP=83fb ", "");
        match decoder.decode(&line) {
            Err(DebugError::MalformedSnapshot { field, .. }) => assert_eq!(field, "SP"),
            other => panic!("expected malformed snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_field_order_change_triggers_rescan() {
        let mut decoder = SnapshotDecoder::new();
        decoder.decode(LINE).unwrap();
        // Older emulators put address and mnemonic in front.
        let prefixed = format!("80d3 LD A,02 {}", LINE);
        let s = decoder.decode(&prefixed).unwrap();
        assert_eq!(s.pc, 0x80D3);
        assert_eq!(s.de2, 0x0001);
        assert_eq!(decoder.rescans(), 2);
    }

    #[test]
    fn test_live_line_without_optional_fields() {
        let mut decoder = SnapshotDecoder::new();
        decoder.decode(LINE).unwrap();
        let live = LINE.replace(" (PC)=3e020603 (SP)=80f5", "");
        let s = decoder.decode_at(&live, 4).unwrap();
        assert_eq!(s.opcodes, None);
        assert_eq!(s.sp_content, None);
        assert_eq!(s.position, Some(4));
        assert_eq!(decoder.rescans(), 1);
    }
}

#[cfg(test)]
mod classify_tests {
    use super::*;

    #[test]
    fn test_call_and_return_shapes() {
        let call = classify(&[0xCD, 0xD3, 0x80], 0x80F2);
        assert_eq!(
            call.class,
            InstructionClass::Call {
                target: 0x80D3,
                condition: None
            }
        );
        assert_eq!(call.length, 3);
        assert_eq!(call.mnemonic, "CALL 80D3h");

        let rst = classify(&[0xFF], 0x8000);
        assert_eq!(rst.class, InstructionClass::Rst { target: 0x38 });

        let reti = classify(&[0xED, 0x4D], 0x0040);
        assert!(matches!(reti.class, InstructionClass::Return { kind: ReturnKind::Reti, .. }));

        // undocumented RETN alias
        let retn = classify(&[0xED, 0x55], 0x0066);
        assert!(matches!(retn.class, InstructionClass::Return { kind: ReturnKind::Retn, .. }));
    }

    #[test]
    fn test_conditional_call_uses_flags() {
        // CALL NZ,9000h
        let call = classify(&[0xC4, 0x00, 0x90], 0x8000);
        let mut older = snap(0x8000, 0x8400);
        older.af = 0x0040; // Z set
        assert!(!call.is_taken(&older));
        assert_eq!(call.predict_sp(&older), Some(0x8400));
        older.af = 0x0000;
        assert!(call.is_taken(&older));
        assert_eq!(call.predict_sp(&older), Some(0x83FE));
    }

    #[test]
    fn test_stack_operands() {
        assert_eq!(classify(&[0xE5], 0).class, InstructionClass::Push(StackOperand::Hl));
        assert_eq!(classify(&[0xF1], 0).class, InstructionClass::Pop(StackOperand::Af));
        assert_eq!(classify(&[0xFD, 0xE5], 0).class, InstructionClass::Push(StackOperand::Iy));
        // PUSH nn is big endian
        assert_eq!(
            classify(&[0xED, 0x8A, 0x12, 0x34], 0).class,
            InstructionClass::Push(StackOperand::Immediate(0x1234))
        );
    }

    #[test]
    fn test_stack_pointer_loads() {
        let older = snap(0x8000, 0x8400);
        let ld_hl = classify(&[0xF9], 0x8000);
        assert_eq!(ld_hl.class, InstructionClass::LoadStackPointer(SpSource::Hl));
        assert_eq!(ld_hl.predict_sp(&older), Some(0x2222));

        let dec = classify(&[0x3B], 0x8000);
        assert_eq!(dec.predict_sp(&older), Some(0x83FF));

        let indirect = classify(&[0xED, 0x7B, 0x00, 0x50], 0x8000);
        assert_eq!(indirect.class, InstructionClass::LoadStackPointer(SpSource::Indirect));
        assert_eq!(indirect.length, 4);
        assert_eq!(indirect.predict_sp(&older), None);
    }

    #[test]
    fn test_lengths_of_other_instructions() {
        assert_eq!(classify(&[0xC3, 0x00, 0x90], 0x8000).next_pc(0x8000), 0x8003);
        assert_eq!(classify(&[0x3E, 0x02], 0x8000).next_pc(0x8000), 0x8002);
        assert_eq!(classify(&[0x18, 0xFE], 0x8000).length, 2);
        assert_eq!(classify(&[0x00], 0x8000).length, 1);
        assert_eq!(classify(&[0xDD, 0x36, 0x01, 0x05], 0x8000).length, 4);
        assert_eq!(classify(&[0xFD, 0x7E, 0x02], 0x8000).length, 3);
        assert_eq!(classify(&[0xDD, 0x23], 0x8000).length, 2);
        assert_eq!(classify(&[0xED, 0x43, 0x00, 0x50], 0x8000).length, 4);
        assert_eq!(classify(&[0xED, 0xB0], 0x8000).length, 2);
    }

    #[test]
    fn test_truncated_bytes_are_other() {
        let call = classify(&[0xCD, 0x00], 0x8000);
        assert_eq!(call.class, InstructionClass::Other);
        assert_eq!(classify(&[], 0x8000).class, InstructionClass::Other);
    }

    #[test]
    fn test_find_call_site() {
        let site = find_call_site(&Z80Classifier, 0x8004, &[0xCD, 0x00, 0x90]).unwrap();
        assert_eq!(site.address, 0x8001);
        assert_eq!(site.target, 0x9000);

        let rst = find_call_site(&Z80Classifier, 0x8004, &[0x00, 0x00, 0xD7]).unwrap();
        assert_eq!(rst.address, 0x8003);
        assert_eq!(rst.target, 0x10);

        assert!(find_call_site(&Z80Classifier, 0x8004, &[0x00, 0x00, 0x00]).is_none());
    }
}

#[cfg(test)]
mod reconstruct_tests {
    use super::*;

    #[test]
    fn test_call_adds_one_frame() {
        let r = reconstructor();
        let a = snap(0x80F2, 0x83FD);
        let b = snap(0x80D3, 0x83FB);
        let mut stack = Some(VirtualCallStack::new(&a));
        let call = classify(&[0xCD, 0xD3, 0x80], a.pc);

        r.forward(&mut stack, &a, Some(&b), &call);

        let stack = stack.unwrap();
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.innermost().unwrap().entry_address, 0x80D3);
        let caller = stack.enclosing().unwrap();
        assert_eq!(caller.caller_stack_pointer, 0x83FD);
        assert_eq!(caller.entry_address, 0x80F2);
        assert_eq!(caller.display_name, "print");
    }

    #[test]
    fn test_return_removes_one_frame() {
        let r = reconstructor();
        let a = snap(0x80F2, 0x83FD);
        let b = snap(0x80D3, 0x83FB);
        let c = snap(0x80E4, 0x83FB);
        let d = snap(0x80F5, 0x83FD);
        let mut stack = Some(VirtualCallStack::new(&a));
        r.forward(&mut stack, &a, Some(&b), &classify(&[0xCD, 0xD3, 0x80], a.pc));
        r.forward(&mut stack, &b, Some(&c), &classify(&[0x3E, 0x02], b.pc));
        assert_eq!(depth(&stack), 2);

        r.forward(&mut stack, &c, Some(&d), &classify(&[0xC9], c.pc));

        assert_eq!(depth(&stack), 1);
        assert_eq!(stack.unwrap().entry_addresses(), vec![0x80F5]);
    }

    #[test]
    fn test_return_without_caller_does_not_underflow() {
        let r = reconstructor();
        let older = snap(0x9002, 0x83FC);
        let newer = snap(0x8004, 0x83FE);
        let mut stack = Some(VirtualCallStack::new(&older));

        r.forward(&mut stack, &older, Some(&newer), &classify(&[0xC9], older.pc));
        assert_eq!(depth(&stack), 1);

        let mut empty = None;
        r.forward(&mut empty, &older, Some(&newer), &classify(&[0xC9], older.pc));
        assert_eq!(depth(&empty), 1);
    }

    #[test]
    fn test_untaken_call_keeps_depth() {
        let r = reconstructor();
        let mut older = snap(0x8000, 0x8400);
        older.af = 0x0040; // Z set, CALL NZ not taken
        let newer = snap(0x8003, 0x8400);
        let mut stack = Some(VirtualCallStack::new(&older));
        r.forward(&mut stack, &older, Some(&newer), &classify(&[0xC4, 0x00, 0x90], older.pc));
        assert_eq!(depth(&stack), 1);
    }

    #[test]
    fn test_push_and_pop_track_locals() {
        let r = reconstructor();
        let s0 = snap(0x8000, 0x8400);
        let s1 = snap(0x8001, 0x83FE);
        let s2 = snap(0x8002, 0x8400);
        let s3 = snap(0x8003, 0x8402);
        let mut stack = Some(VirtualCallStack::new(&s0));

        r.forward(&mut stack, &s0, Some(&s1), &classify(&[0xE5], s0.pc));
        assert_eq!(
            stack.as_ref().unwrap().innermost().unwrap().local_values,
            vec![LocalValue::Known(0x2222)]
        );

        r.forward(&mut stack, &s1, Some(&s2), &classify(&[0xD1], s1.pc));
        assert!(stack.as_ref().unwrap().innermost().unwrap().local_values.is_empty());

        // pop of a value pushed before the recording started
        r.forward(&mut stack, &s2, Some(&s3), &classify(&[0xD1], s2.pc));
        assert_eq!(depth(&stack), 1);
        assert!(stack.unwrap().innermost().unwrap().local_values.is_empty());
    }

    #[test]
    fn test_load_stack_pointer_adjusts_locals() {
        let r = reconstructor();
        // LD SP,HL growing the stack by 2 words
        let mut s0 = snap(0x8000, 0x8400);
        s0.hl = 0x83FC;
        let s1 = snap(0x8001, 0x83FC);
        let mut stack = Some(VirtualCallStack::new(&s0));
        r.forward(&mut stack, &s0, Some(&s1), &classify(&[0xF9], s0.pc));
        assert_eq!(
            stack.as_ref().unwrap().innermost().unwrap().local_values,
            vec![LocalValue::Unknown, LocalValue::Unknown]
        );

        // LD SP,8402h shrinking by 3 words removes only the 2 there are
        let s2 = snap(0x8004, 0x8402);
        r.forward(&mut stack, &s1, Some(&s2), &classify(&[0x31, 0x02, 0x84], s1.pc));
        assert!(stack.as_ref().unwrap().innermost().unwrap().local_values.is_empty());
        assert_eq!(depth(&stack), 1);
    }

    #[test]
    fn test_locals_survive_a_call() {
        let r = reconstructor();
        let s0 = snap(0x8000, 0x8400);
        let s1 = snap(0x8001, 0x83FE);
        let s2 = snap(0x9000, 0x83FC);
        let s3 = snap(0x8004, 0x83FE);
        let mut stack = Some(VirtualCallStack::new(&s0));
        r.forward(&mut stack, &s0, Some(&s1), &classify(&[0xC5], s0.pc));
        r.forward(&mut stack, &s1, Some(&s2), &classify(&[0xCD, 0x00, 0x90], s1.pc));
        {
            let stack = stack.as_ref().unwrap();
            assert!(stack.innermost().unwrap().local_values.is_empty());
            assert_eq!(stack.enclosing().unwrap().display_name, "sub");
            assert_eq!(
                stack.enclosing().unwrap().local_values,
                vec![LocalValue::Known(0x1111)]
            );
        }
        r.forward(&mut stack, &s2, Some(&s3), &classify(&[0xC9], s2.pc));
        assert_eq!(
            stack.unwrap().innermost().unwrap().local_values,
            vec![LocalValue::Known(0x1111)]
        );
    }

    #[test]
    fn test_reaching_live_edge_discards_stack() {
        let r = reconstructor();
        let s0 = snap(0x8000, 0x8400);
        let mut stack = Some(VirtualCallStack::new(&s0));
        r.forward(&mut stack, &s0, None, &classify(&[0x00], s0.pc));
        assert!(stack.is_none());
    }

    #[test]
    fn test_interrupt_entry_and_reti() {
        let r = reconstructor();
        let s0 = snap(0x8000, 0x83FD);
        let mut s1 = snap(0x0038, 0x83FB);
        s1.sp_content = Some(0x8001);
        let s2 = snap(0x0039, 0x83FB);
        let s3 = snap(0x8001, 0x83FD);
        let mut stack = Some(VirtualCallStack::new(&s0));

        // NOP, then the interrupt is taken
        r.forward(&mut stack, &s0, Some(&s1), &classify(&[0x00], s0.pc));
        {
            let stack = stack.as_ref().unwrap();
            assert_eq!(stack.depth(), 2);
            let frame = stack.enclosing().unwrap();
            assert_eq!(frame.display_name, INTERRUPT);
            assert_eq!(frame.entry_address, 0x8001);
            assert_eq!(frame.caller_stack_pointer, 0x83FD);
        }

        r.forward(&mut stack, &s1, Some(&s2), &classify(&[0x00], s1.pc));
        r.forward(&mut stack, &s2, Some(&s3), &classify(&[0xED, 0x4D], s2.pc));
        assert_eq!(stack.unwrap().entry_addresses(), vec![0x8001]);
    }

    #[test]
    fn test_interrupt_after_call() {
        let r = reconstructor();
        let s0 = snap(0x8001, 0x83FE);
        // CALL 9000h executed, then an interrupt before its first instruction
        let mut s1 = snap(0x0038, 0x83FA);
        s1.sp_content = Some(0x9000);
        let mut stack = Some(VirtualCallStack::new(&s0));
        r.forward(&mut stack, &s0, Some(&s1), &classify(&[0xCD, 0x00, 0x90], s0.pc));

        let frames = stack.as_ref().unwrap().to_vec();
        let names: Vec<&str> = frames.iter().map(|f| f.display_name.as_str()).collect();
        assert_eq!(names, vec!["current", INTERRUPT, "sub"]);
        assert_eq!(frames[1].entry_address, 0x9000);
        assert_eq!(frames[1].caller_stack_pointer, 0x83FC);

        // walking back undoes both
        r.backward(&mut stack, &s0, &s1, &classify(&[0xCD, 0x00, 0x90], s0.pc), None);
        assert_eq!(stack.unwrap().entry_addresses(), vec![0x8001]);
    }

    #[test]
    fn test_jump_to_vector_without_stack_change_is_not_interrupt() {
        let heuristic = InterruptHeuristic::default();
        let older = snap(0x8000, 0x8400);
        let newer = snap(0x0038, 0x8400);
        assert!(!heuristic.is_interrupt_entry(&older, &newer, &classify(&[0xC3, 0x38, 0x00], older.pc)));
        // RST 38h pushes exactly what it predicts
        let rst = snap(0x0038, 0x83FE);
        assert!(!heuristic.is_interrupt_entry(&older, &rst, &classify(&[0xFF], older.pc)));
    }

    #[test]
    fn test_backward_over_return_uses_caller_site() {
        let r = reconstructor();
        let older = snap(0x9002, 0x83FC);
        let newer = snap(0x8004, 0x83FE);
        let mut stack = Some(VirtualCallStack::new(&newer));
        let site = find_call_site(&Z80Classifier, newer.pc, &[0xCD, 0x00, 0x90]);

        r.backward(&mut stack, &older, &newer, &classify(&[0xC9], older.pc), site);

        let frames = stack.unwrap().to_vec();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].entry_address, 0x9002);
        assert_eq!(frames[1].entry_address, 0x8001);
        assert_eq!(frames[1].caller_stack_pointer, 0x83FE);
        assert_eq!(frames[1].display_name, "sub");
    }

    #[test]
    fn test_backward_over_return_without_call() {
        let r = reconstructor();
        let older = snap(0x9002, 0x83FC);
        let newer = snap(0x8004, 0x83FE);

        let mut stack = Some(VirtualCallStack::new(&newer));
        r.backward(&mut stack, &older, &newer, &classify(&[0xC9], older.pc), None);
        assert_eq!(stack.unwrap().enclosing().unwrap().display_name, UNKNOWN_CALLER);

        let mut stack = Some(VirtualCallStack::new(&newer));
        r.backward(&mut stack, &older, &newer, &classify(&[0xED, 0x4D], older.pc), None);
        assert_eq!(stack.unwrap().enclosing().unwrap().display_name, INTERRUPT);
    }

    #[test]
    fn test_stack_switch_by_half_the_address_space() {
        let r = reconstructor();
        let mut s0 = snap(0xC000, 0xC000);
        s0.hl = 0x4000;
        let s1 = snap(0xC001, 0x4000);
        let mut stack = Some(VirtualCallStack::new(&s0));
        r.forward(&mut stack, &s0, Some(&s1), &classify(&[0xF9], s0.pc));
        assert_eq!(
            stack.as_ref().unwrap().innermost().unwrap().local_values.len(),
            0x4000
        );

        // and back up again drops them all
        let mut s2 = snap(0xC001, 0x4000);
        s2.hl = 0xC000;
        let s3 = snap(0xC002, 0xC000);
        r.forward(&mut stack, &s2, Some(&s3), &classify(&[0xF9], s2.pc));
        assert!(stack.unwrap().innermost().unwrap().local_values.is_empty());
    }

    #[test]
    fn test_interrupt_return_address_uses_instruction_length() {
        let r = reconstructor();
        // LD A,02 then an interrupt, with no (SP) in the line
        let s0 = snap(0x8000, 0x83FD);
        let s1 = snap(0x0038, 0x83FB);
        let mut stack = Some(VirtualCallStack::new(&s0));
        r.forward(&mut stack, &s0, Some(&s1), &classify(&[0x3E, 0x02], s0.pc));
        let frame = stack.as_ref().unwrap().enclosing().unwrap().clone();
        assert_eq!(frame.display_name, INTERRUPT);
        assert_eq!(frame.entry_address, 0x8002);
    }

    #[test]
    fn test_backward_load_stack_pointer_mirrors_forward() {
        let r = reconstructor();
        let mut s0 = snap(0x8000, 0x8400);
        s0.hl = 0x83FA;
        let s1 = snap(0x8001, 0x83FA);
        let ld = classify(&[0xF9], s0.pc);
        let mut stack = Some(VirtualCallStack::new(&s0));
        r.forward(&mut stack, &s0, Some(&s1), &ld);
        assert_eq!(stack.as_ref().unwrap().innermost().unwrap().local_values.len(), 3);
        r.backward(&mut stack, &s0, &s1, &ld, None);
        assert!(stack.unwrap().innermost().unwrap().local_values.is_empty());
    }

    #[test]
    fn test_round_trip_restores_stack() {
        let r = reconstructor();
        // 8000 PUSH BC / 8001 CALL 9000h / 9000 PUSH HL / 9001 POP HL / 9002 RET / 8004 POP BC
        let program: Vec<(RegisterSnapshot, Vec<u8>)> = vec![
            (snap(0x8000, 0x8400), vec![0xC5]),
            (snap(0x8001, 0x83FE), vec![0xCD, 0x00, 0x90]),
            (snap(0x9000, 0x83FC), vec![0xE5]),
            (snap(0x9001, 0x83FA), vec![0xE1]),
            (snap(0x9002, 0x83FC), vec![0xC9]),
            (snap(0x8004, 0x83FE), vec![0xC1]),
            (snap(0x8005, 0x8400), vec![0x00]),
        ];

        let mut stack = Some(VirtualCallStack::new(&program[0].0));
        let mut states: Vec<Vec<Frame>> = vec![stack.as_ref().unwrap().to_vec()];
        for pair in program.windows(2) {
            let (older, bytes) = &pair[0];
            let newer = &pair[1].0;
            r.forward(&mut stack, older, Some(newer), &classify(bytes, older.pc));
            assert!(depth(&stack) >= 1);
            states.push(stack.as_ref().unwrap().to_vec());
        }
        assert_eq!(depth(&stack), 1);

        for (k, pair) in program.windows(2).enumerate().rev() {
            let (older, bytes) = &pair[0];
            let newer = &pair[1].0;
            let instruction = classify(bytes, older.pc);
            let caller = if instruction.class.is_return() {
                find_call_site(&Z80Classifier, newer.pc, &[0xCD, 0x00, 0x90])
            } else {
                None
            };
            r.backward(&mut stack, older, newer, &instruction, caller);
            let now = stack.as_ref().unwrap();
            let expected: Vec<u16> = states[k].iter().map(|f| f.entry_address).collect();
            assert_eq!(now.entry_addresses(), expected, "after undoing step {}", k);
            assert_eq!(now.to_vec(), states[k]);
        }
    }
}

// Target whose history fetches can be made to fail
struct FlakyTarget {
    inner: TraceTarget,
    fail: bool,
}

impl Target for FlakyTarget {
    fn capability(&self) -> TransportCapability {
        self.inner.capability()
    }
    fn fetch_snapshot(&mut self, index: usize) -> Result<Option<RegisterSnapshot>> {
        if self.fail {
            return Err(DebugError::Target("connection reset".to_string()));
        }
        self.inner.fetch_snapshot(index)
    }
    fn registers(&mut self) -> Result<RegisterSnapshot> {
        self.inner.registers()
    }
    fn run_live(&mut self, mode: RunMode) -> Result<CompletionReason> {
        self.inner.run_live(mode)
    }
    fn step_live(&mut self, kind: StepKind) -> Result<RegisterSnapshot> {
        self.inner.step_live(kind)
    }
    fn real_call_stack(&mut self) -> Result<Vec<Frame>> {
        self.inner.real_call_stack()
    }
    fn read_memory(&mut self, address: u16, len: usize) -> Result<Vec<u8>> {
        self.inner.read_memory(address, len)
    }
}

#[cfg(test)]
mod history_tests {
    use super::*;
    use std::sync::atomic::Ordering;

    fn trace() -> TraceTarget {
        TraceTarget::new(
            snap(0x8003, 0x8400),
            vec![snap(0x8002, 0x8400), snap(0x8001, 0x8400), snap(0x8000, 0x8400)],
        )
    }

    #[test]
    fn test_one_fetch_per_new_entry() {
        let mut target = trace();
        let fetches = target.fetch_counter();
        let mut history = HistoryCursor::new();

        let first = history.step_back(&mut target).unwrap().unwrap();
        assert_eq!(first.pc, 0x8002);
        assert_eq!(first.position, Some(0));
        assert_eq!(fetches.load(Ordering::SeqCst), 1);

        assert!(history.step_forward().is_none());
        assert!(!history.is_historical());
        for _ in 0..5 {
            history.step_back(&mut target).unwrap();
            history.step_forward();
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_of_history() {
        let mut target = trace();
        let fetches = target.fetch_counter();
        let mut history = HistoryCursor::new();
        for _ in 0..3 {
            assert!(history.step_back(&mut target).unwrap().is_some());
        }
        assert!(history.step_back(&mut target).unwrap().is_none());
        assert!(history.step_back(&mut target).unwrap().is_none());
        assert_eq!(history.position(), 3);
        assert_eq!(history.current().unwrap().pc, 0x8000);
        assert_eq!(fetches.load(Ordering::SeqCst), 4);
        assert_eq!(history.visited_addresses(), vec![0x8002, 0x8001, 0x8000]);

        assert_eq!(history.step_forward().unwrap().pc, 0x8001);
        assert_eq!(history.step_forward().unwrap().pc, 0x8002);
        assert!(history.step_forward().is_none());
    }

    #[test]
    fn test_limit_ends_history_early() {
        let mut target = trace();
        let mut history = HistoryCursor::with_limit(2);
        assert!(history.step_back(&mut target).unwrap().is_some());
        assert!(history.step_back(&mut target).unwrap().is_some());
        assert!(history.step_back(&mut target).unwrap().is_none());
        assert_eq!(history.position(), 2);
    }

    #[test]
    fn test_failed_fetch_leaves_cursor() {
        let mut target = FlakyTarget {
            inner: trace(),
            fail: false,
        };
        let mut history = HistoryCursor::new();
        history.step_back(&mut target).unwrap();
        target.fail = true;
        match history.step_back(&mut target) {
            Err(DebugError::HistoryUnavailable(_)) => {}
            other => panic!("expected history unavailable, got {:?}", other),
        }
        assert_eq!(history.position(), 1);
        assert_eq!(history.visited_addresses(), vec![0x8002]);
    }

    #[test]
    fn test_clear_forgets_everything() {
        let mut target = trace();
        let fetches = target.fetch_counter();
        let mut history = HistoryCursor::new();
        history.step_back(&mut target).unwrap();
        history.clear();
        assert!(!history.is_historical());
        assert!(history.visited_addresses().is_empty());
        history.step_back(&mut target).unwrap();
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }
}

#[cfg(test)]
mod config_tests {
    use serde_json::json;
    use std::io::Write;
    use z80_debugger::config::{RemoteConfig, SessionConfig, TargetSource};
    use z80_debugger::parser::SymbolResolver;
    use z80_debugger::DebugError;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert!(config.stop_on_entry);
        assert_eq!(config.interrupt_vectors, vec![0x0038, 0x0066]);
        assert_eq!(config.history.reverse_debug_instruction_count, 10000);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_from_launch_arguments() {
        let arguments = json!({
            "remote": { "host": "sim", "port": 10001 },
            "history": { "reverseDebugInstructionCount": 500 },
            "interruptVectors": [56],
            "labels": { "main": 32768, "sub": 36864 },
            "topOfStack": 33792,
            "stopOnEntry": false
        });
        let config = SessionConfig::from_launch_arguments(&arguments).unwrap();
        assert_eq!(
            config.target_source().unwrap(),
            TargetSource::Remote(RemoteConfig {
                host: "sim".to_string(),
                port: 10001
            })
        );
        assert_eq!(config.history.reverse_debug_instruction_count, 500);
        assert_eq!(config.interrupt_vectors, vec![0x38]);
        assert_eq!(config.top_of_stack, Some(0x8400));
        assert!(!config.stop_on_entry);
        assert_eq!(config.label_table().name_for(0x9000).as_deref(), Some("sub"));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "trace": "run.trace", "log": {{ "level": "debug" }} }}"#).unwrap();
        let config = SessionConfig::from_file(file.path()).unwrap();
        assert_eq!(config.log.level, "debug");
        match config.target_source().unwrap() {
            TargetSource::Trace(path) => assert_eq!(path.to_str(), Some("run.trace")),
            other => panic!("expected trace, got {:?}", other),
        }
    }

    #[test]
    fn test_target_source_must_be_unique() {
        let neither = SessionConfig::default();
        assert!(matches!(neither.target_source(), Err(DebugError::Config(_))));

        let both = SessionConfig::from_launch_arguments(&json!({
            "trace": "a.trace",
            "remote": {}
        }))
        .unwrap();
        assert!(matches!(both.target_source(), Err(DebugError::Config(_))));
    }

    #[test]
    fn test_remote_parse() {
        let remote = RemoteConfig::parse("emulator:12000").unwrap();
        assert_eq!(remote.address(), "emulator:12000");
        assert_eq!(RemoteConfig::parse("emulator").unwrap().port, 10000);
        assert!(RemoteConfig::parse("emulator:x").is_err());
    }

    #[test]
    fn test_invalid_json_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            SessionConfig::from_file(file.path()),
            Err(DebugError::Json(_))
        ));
    }
}

#[cfg(test)]
mod simulator_tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use z80_debugger::target::{CommandQueue, SimulatorTarget, Transport};

    type Responder = Box<dyn FnMut(&str) -> String + Send>;

    // Answers commands from a closure and records them
    struct Scripted {
        log: Arc<Mutex<Vec<String>>>,
        respond: Responder,
    }

    impl Transport for Scripted {
        fn run(&mut self, command: &str) -> Result<String> {
            self.log.lock().unwrap().push(command.to_string());
            Ok((self.respond)(command))
        }
    }

    fn register_line(pc: u16, sp: u16) -> String {
        format!(
            "PC={:04x} SP={:04x} AF=0000 BC=1111 HL=2222 DE=0000 IX=0000 IY=0000 AF'=0000 BC'=0000 HL'=0000 DE'=0000 I=00 R=00 IM1 IFF--",
            pc, sp
        )
    }

    fn simulator(
        respond: impl FnMut(&str) -> String + Send + 'static,
    ) -> (SimulatorTarget, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let queue = CommandQueue::spawn(Scripted {
            log: Arc::clone(&log),
            respond: Box::new(respond),
        });
        let target = SimulatorTarget::with_queue(queue, None, 500).unwrap();
        (target, log)
    }

    fn logged(log: &Arc<Mutex<Vec<String>>>, command: &str) -> bool {
        log.lock().unwrap().iter().any(|c| c == command)
    }

    #[test]
    fn test_setup_detects_fast_breakpoints() {
        let (target, log) = simulator(|command| match command {
            "check-extensions" => "Extensions available.".to_string(),
            _ => String::new(),
        });
        assert_eq!(target.capability(), TransportCapability::FastBreakpoints);
        assert!(logged(&log, "cpu-history set-max-size 500"));
        assert!(logged(&log, "extended-stack enabled yes"));
        assert!(logged(&log, "clear-all-fast-breakpoints"));
    }

    #[test]
    fn test_setup_without_extensions() {
        let (target, log) = simulator(|command| match command {
            "check-extensions" => "Unknown command".to_string(),
            "cpu-history clear" => "Error. Not enabled".to_string(),
            _ => String::new(),
        });
        assert_eq!(target.capability(), TransportCapability::Basic);
        assert!(!logged(&log, "clear-all-fast-breakpoints"));
    }

    #[test]
    fn test_history_fetch() {
        let (mut target, log) = simulator(|command| match command {
            "cpu-history get 0" => register_line(0x9002, 0x83FC),
            c if c.starts_with("cpu-history get") => "Error. Index out of range".to_string(),
            _ => String::new(),
        });
        let entry = target.fetch_snapshot(0).unwrap().unwrap();
        assert_eq!(entry.pc, 0x9002);
        assert_eq!(entry.position, Some(0));
        assert_eq!(target.fetch_snapshot(1).unwrap(), None);
        assert!(logged(&log, "cpu-history get 1"));
    }

    #[test]
    fn test_run_until_with_breakpoint_slot() {
        let (mut target, log) = simulator(|command| match command {
            "run" => "Running until a breakpoint, key press or data sent\nBreakpoint fired: PC=8004H\n".to_string(),
            "get-registers" => register_line(0x8004, 0x83FE),
            _ => String::new(),
        });
        let reason = target
            .run_live(RunMode::Until {
                address: 0x8004,
                stack_pointer: Some(0x83FE),
            })
            .unwrap();
        assert_eq!(reason, CompletionReason::ReachedAddress);
        let commands = log.lock().unwrap().clone();
        let run = commands.iter().position(|c| c == "run").unwrap();
        assert!(commands[..run].contains(&"set-breakpoint 1 PC=08004h and SP>=33790".to_string()));
        assert!(commands[..run].contains(&"enable-breakpoint 1".to_string()));
        assert_eq!(commands[run + 1], "disable-breakpoint 1");
    }

    #[test]
    fn test_run_until_with_fast_breakpoint() {
        let (mut target, log) = simulator(|command| match command {
            "check-extensions" => "Extensions available.".to_string(),
            "run" => "Running until a breakpoint, key press or data sent\nBreakpoint fired\n".to_string(),
            "get-registers" => register_line(0x8004, 0x83FE),
            _ => String::new(),
        });
        target
            .run_live(RunMode::Until {
                address: 0x8004,
                stack_pointer: Some(0x83FE),
            })
            .unwrap();
        let commands = log.lock().unwrap().clone();
        let run = commands.iter().position(|c| c == "run").unwrap();
        assert_eq!(commands[run - 1], "set-fast-breakpoint 32772 SP>=33790");
        assert_eq!(commands[run + 1], "clear-fast-breakpoint 32772");
    }

    #[test]
    fn test_continue_reports_user_breakpoint() {
        let (mut target, _log) = simulator(|command| match command {
            "run" => "Running until a breakpoint, key press or data sent\nBreakpoint fired: PC=9001H\n".to_string(),
            "get-registers" => register_line(0x9001, 0x83FA),
            _ => String::new(),
        });
        target.sync_breakpoints(&[0x9001]).unwrap();
        assert_eq!(
            target.run_live(RunMode::Continue).unwrap(),
            CompletionReason::Breakpoint { address: 0x9001 }
        );
    }

    #[test]
    fn test_continue_without_break_line_is_pause() {
        let (mut target, _log) = simulator(|command| match command {
            "run" => "Running until a breakpoint, key press or data sent\n".to_string(),
            "get-registers" => register_line(0x8000, 0x8400),
            _ => String::new(),
        });
        assert_eq!(target.run_live(RunMode::Continue).unwrap(), CompletionReason::Paused);
    }

    #[test]
    fn test_fast_breakpoints_are_synced_incrementally() {
        let (mut target, log) = simulator(|command| match command {
            "check-extensions" => "Extensions available.".to_string(),
            _ => String::new(),
        });
        target.sync_breakpoints(&[0x8000, 0x9000]).unwrap();
        target.sync_breakpoints(&[0x9000, 0x9001]).unwrap();
        assert!(logged(&log, "set-fast-breakpoint 32768"));
        assert!(logged(&log, "clear-fast-breakpoint 32768"));
        assert!(logged(&log, "set-fast-breakpoint 36865"));
        let sets = log
            .lock()
            .unwrap()
            .iter()
            .filter(|c| *c == "set-fast-breakpoint 36864")
            .count();
        assert_eq!(sets, 1);
    }

    #[test]
    fn test_real_call_stack_from_extended_stack() {
        let (target, log) = simulator(|command| match command {
            "get-registers" => register_line(0x9001, 0x83F8),
            "extended-stack get 3" => "2222H push\n8004H call\n1111H push\n".to_string(),
            "read-memory 32769 3" => "CD0090".to_string(),
            _ => String::new(),
        });
        let mut labels = LabelTable::new();
        labels.insert("sub", 0x9000);
        let mut target = target.with_labels(labels).with_top_of_stack(Some(0x83FE));

        let frames = target.real_call_stack().unwrap();
        assert!(logged(&log, "extended-stack get 3"));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].entry_address, 0x9001);
        assert_eq!(frames[0].local_values, vec![LocalValue::Known(0x2222)]);
        assert_eq!(frames[1].entry_address, 0x8001);
        assert_eq!(frames[1].caller_stack_pointer, 0x83FC);
        assert_eq!(frames[1].display_name, "sub");
        assert_eq!(frames[1].local_values, vec![LocalValue::Known(0x1111)]);
    }

    #[test]
    fn test_read_memory_error() {
        let (mut target, _log) = simulator(|command| match command {
            c if c.starts_with("read-memory") => "Error. Address out of range".to_string(),
            _ => String::new(),
        });
        assert!(matches!(target.read_memory(0x8000, 2), Err(DebugError::Target(_))));
    }
}
