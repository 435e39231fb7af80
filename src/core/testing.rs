//! In-memory inferior used by the unit tests.

use std::cell::Cell;
use std::ops::Range;

use super::inferior::{Inferior, InferiorError};
use super::memory::MemoryError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Write { address: u64, data: Vec<u8> },
    SetPc(u64),
    Step,
    Resume,
}

pub struct FakeInferior {
    pid: i32,
    base: u64,
    memory: Vec<u8>,
    holes: Vec<Range<u64>>,
    pc: u64,
    free_slots: Vec<u8>,
    fail_step: bool,
    /// Bytes the next write gets through before it fails
    torn_write: Option<usize>,
    reads: Cell<usize>,
    pub events: Vec<Event>,
}

impl FakeInferior {
    /// `len` bytes of text at `base`, filled with a recognizable pattern
    pub fn new(pid: i32, base: u64, len: usize) -> Self {
        Self {
            pid,
            base,
            memory: (0..len).map(|i| (i as u8) ^ 0x5a).collect(),
            holes: Vec::new(),
            pc: base,
            free_slots: Vec::new(),
            fail_step: false,
            torn_write: None,
            reads: Cell::new(0),
            events: Vec::new(),
        }
    }

    pub fn with_debug_slots(mut self, count: u8) -> Self {
        self.free_slots = (0..count).rev().collect();
        self
    }

    /// Duplicate the address space the way fork does
    pub fn fork(&self, pid: i32) -> Self {
        Self {
            pid,
            base: self.base,
            memory: self.memory.clone(),
            holes: self.holes.clone(),
            pc: self.pc,
            free_slots: Vec::new(),
            fail_step: false,
            torn_write: None,
            reads: Cell::new(0),
            events: Vec::new(),
        }
    }

    pub fn unmap(&mut self, range: Range<u64>) {
        self.holes.push(range);
    }

    pub fn map_all(&mut self) {
        self.holes.clear();
    }

    pub fn fail_next_steps(&mut self) {
        self.fail_step = true;
    }

    /// Make the next write stop after `done` bytes and report a short transfer
    pub fn tear_next_write(&mut self, done: usize) {
        self.torn_write = Some(done);
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.memory.clone()
    }

    pub fn bytes(&self, address: u64, len: usize) -> Vec<u8> {
        let start = (address - self.base) as usize;
        self.memory[start..start + len].to_vec()
    }

    pub fn writes_to(&self, address: u64) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::Write { address: a, .. } if *a == address))
            .count()
    }

    pub fn reads(&self) -> usize {
        self.reads.get()
    }

    pub fn free_slots(&self) -> usize {
        self.free_slots.len()
    }

    fn check(&self, address: u64, len: usize) -> Result<usize, MemoryError> {
        let end = address + len as u64;
        let in_range = address >= self.base && end <= self.base + self.memory.len() as u64;
        let in_hole = self
            .holes
            .iter()
            .any(|h| address < h.end && h.start < end);
        if !in_range || in_hole {
            return Err(MemoryError::Unmapped { address });
        }
        Ok((address - self.base) as usize)
    }
}

impl Inferior for FakeInferior {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>, MemoryError> {
        self.reads.set(self.reads.get() + 1);
        let start = self.check(address, len)?;
        Ok(self.memory[start..start + len].to_vec())
    }

    fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        let start = self.check(address, data.len())?;
        if let Some(done) = self.torn_write.take() {
            let done = done.min(data.len());
            self.memory[start..start + done].copy_from_slice(&data[..done]);
            return Err(MemoryError::ShortTransfer {
                address,
                wanted: data.len(),
                done,
            });
        }
        self.memory[start..start + data.len()].copy_from_slice(data);
        self.events.push(Event::Write {
            address,
            data: data.to_vec(),
        });
        Ok(())
    }

    fn instruction_pointer(&mut self) -> Result<u64, InferiorError> {
        Ok(self.pc)
    }

    fn set_instruction_pointer(&mut self, pc: u64) -> Result<(), InferiorError> {
        self.pc = pc;
        self.events.push(Event::SetPc(pc));
        Ok(())
    }

    fn single_step(&mut self) -> Result<(), InferiorError> {
        if self.fail_step {
            return Err(InferiorError::Gone { pid: self.pid });
        }
        self.events.push(Event::Step);
        Ok(())
    }

    fn resume(&mut self) -> Result<(), InferiorError> {
        self.events.push(Event::Resume);
        Ok(())
    }

    fn claim_debug_slot(&mut self, _address: u64) -> Option<u8> {
        self.free_slots.pop()
    }

    fn release_debug_slot(&mut self, slot: u8) {
        self.free_slots.push(slot);
    }
}
