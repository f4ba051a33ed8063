//! Code blocks: append-only (but patchable) buffers of machine code.
//!
//! A [`CodeBlock`] wraps a fixed-size span of the executable mapping and
//! tracks a write cursor, a single-use label table for short intra-sequence
//! jumps, and the page-granular W^X bookkeeping. Patching rewinds the cursor
//! into already-written code and overwrites in place; instruction sizes are
//! arranged so that patched code never outgrows what it replaces.

use std::mem;

use crate::memory;

pub mod x86_64;

/// Pointer to a piece of machine code.
/// There is no null constant; use `Option<CodePtr>` for absence.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Debug)]
#[repr(C)]
pub struct CodePtr(*const u8);

impl CodePtr {
    pub fn raw_ptr(&self) -> *const u8 {
        let CodePtr(ptr) = *self;
        ptr
    }

    pub fn into_i64(&self) -> i64 {
        let CodePtr(ptr) = self;
        *ptr as i64
    }

    pub fn into_usize(&self) -> usize {
        let CodePtr(ptr) = self;
        *ptr as usize
    }
}

impl From<*mut u8> for CodePtr {
    fn from(value: *mut u8) -> Self {
        assert!(!value.is_null());
        CodePtr(value)
    }
}

// 1 is not page aligned so this won't match any real page
const ALIGNED_WRITE_POSITION_NONE: usize = 1;

/// Reference to an assembler label.
struct LabelRef {
    // Position in the code block where the 32-bit displacement lives
    pos: usize,

    // Label which this refers to
    label_idx: usize,
}

/// Block of memory into which instructions can be assembled.
pub struct CodeBlock {
    // Backing storage for dummy blocks used in tests. Real blocks point
    // into the shared executable mapping instead.
    #[allow(unused)]
    dummy_block: Vec<u8>,

    // Pointer to memory we are writing into
    mem_block: *mut u8,

    // Memory block size
    mem_size: usize,

    // Current writing position
    write_pos: usize,

    // Table of registered label addresses
    label_addrs: Vec<usize>,

    // Table of registered label names
    label_names: Vec<String>,

    // References to labels
    label_refs: Vec<LabelRef>,

    // Keep track of the page most recently made writable, so that
    // sequential writes only pay for one mprotect per page.
    current_aligned_write_pos: usize,

    // Protection granularity
    page_size: usize,

    // Whether this block really lives in the executable mapping.
    // Dummy blocks skip protection changes.
    protected: bool,

    // Bytes below this offset are permanently patch-exempt
    frozen_bytes: usize,

    // Set if the block was unable to output some instructions, for
    // example when there is not enough space or when a jump target is
    // too far away.
    dropped_bytes: bool,
}

impl CodeBlock {
    /// Make a code block over a span of the executable mapping.
    pub fn new(mem_block: *mut u8, mem_size: usize, page_size: usize) -> Self {
        Self {
            dummy_block: Vec::new(),
            mem_block,
            mem_size,
            write_pos: 0,
            label_addrs: Vec::new(),
            label_names: Vec::new(),
            label_refs: Vec::new(),
            current_aligned_write_pos: ALIGNED_WRITE_POSITION_NONE,
            page_size,
            protected: true,
            frozen_bytes: 0,
            dropped_bytes: false,
        }
    }

    /// Make a code block over plain heap memory. The contents can never be
    /// executed; this exists so compilation and patching logic can be
    /// exercised without an executable mapping.
    pub fn new_dummy(mem_size: usize) -> Self {
        let mut dummy_block = vec![0; mem_size];
        let mem_ptr = dummy_block.as_mut_ptr();

        Self {
            dummy_block,
            mem_block: mem_ptr,
            mem_size,
            write_pos: 0,
            label_addrs: Vec::new(),
            label_names: Vec::new(),
            label_refs: Vec::new(),
            current_aligned_write_pos: ALIGNED_WRITE_POSITION_NONE,
            page_size: 4096,
            protected: false,
            frozen_bytes: 0,
            dropped_bytes: false,
        }
    }

    /// Check if this code block has sufficient remaining capacity
    pub fn has_capacity(&self, num_bytes: usize) -> bool {
        self.write_pos + num_bytes < self.mem_size
    }

    pub fn get_mem_size(&self) -> usize {
        self.mem_size
    }

    pub fn get_write_pos(&self) -> usize {
        self.write_pos
    }

    // Set the current write position
    pub fn set_pos(&mut self, pos: usize) {
        // Bounds-check here since callers compute positions from pointers
        assert!(pos < self.mem_size);
        self.write_pos = pos;
    }

    // Align the current write position to a multiple of bytes
    pub fn align_pos(&mut self, multiple: u32) {
        let multiple: usize = multiple.try_into().unwrap();
        let pos = self.get_write_ptr().raw_ptr() as usize;
        let remainder = pos % multiple;

        if remainder != 0 {
            let pad = multiple - remainder;
            self.set_pos(self.get_write_pos() + pad);
        }
    }

    // Set the current write position from a pointer
    pub fn set_write_ptr(&mut self, code_ptr: CodePtr) {
        let pos = (code_ptr.raw_ptr() as usize) - (self.mem_block as usize);
        self.set_pos(pos);
    }

    // Get a direct pointer into the memory block
    pub fn get_ptr(&self, offset: usize) -> CodePtr {
        unsafe {
            let ptr = self.mem_block.add(offset);
            CodePtr(ptr)
        }
    }

    // Get a direct pointer to the current write position
    pub fn get_write_ptr(&self) -> CodePtr {
        self.get_ptr(self.write_pos)
    }

    /// Whether a pointer falls inside this block's span.
    pub fn contains_ptr(&self, ptr: CodePtr) -> bool {
        let addr = ptr.raw_ptr() as usize;
        let base = self.mem_block as usize;
        addr >= base && addr < base + self.mem_size
    }

    /// Byte offset of a pointer into this block.
    pub fn ptr_offset(&self, ptr: CodePtr) -> usize {
        assert!(self.contains_ptr(ptr));
        (ptr.raw_ptr() as usize) - (self.mem_block as usize)
    }

    /// Read back a little-endian u64 previously written at `offset`.
    pub fn read_u64_at(&self, offset: usize) -> u64 {
        assert!(offset + 8 <= self.mem_size);
        let mut bytes = [0u8; 8];
        unsafe {
            std::ptr::copy_nonoverlapping(self.mem_block.add(offset), bytes.as_mut_ptr(), 8);
        }
        u64::from_le_bytes(bytes)
    }

    // Write a single byte at the current position
    pub fn write_byte(&mut self, byte: u8) {
        if self.write_pos < self.mem_size {
            self.mark_position_writable(self.write_pos);
            unsafe { self.mem_block.add(self.write_pos).write(byte) };
            self.write_pos += 1;
        } else {
            self.dropped_bytes = true;
        }
    }

    // Write multiple bytes starting from the current position
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.write_byte(*byte);
        }
    }

    // Write an integer over a given number of bits at the current position
    pub fn write_int(&mut self, val: u64, num_bits: u32) {
        assert!(num_bits > 0);
        assert!(num_bits % 8 == 0);

        match num_bits {
            8 => self.write_byte(val as u8),
            16 => self.write_bytes(&[(val & 0xff) as u8, ((val >> 8) & 0xff) as u8]),
            32 => self.write_bytes(&[
                (val & 0xff) as u8,
                ((val >> 8) & 0xff) as u8,
                ((val >> 16) & 0xff) as u8,
                ((val >> 24) & 0xff) as u8,
            ]),
            _ => {
                let mut cur = val;
                for _ in 0..(num_bits / 8) {
                    self.write_byte((cur & 0xff) as u8);
                    cur >>= 8;
                }
            }
        }
    }

    /// Check if bytes have been dropped (unwritten because of insufficient space)
    pub fn has_dropped_bytes(&self) -> bool {
        self.dropped_bytes
    }

    /// Offset below which code is never patched.
    pub fn get_frozen_bytes(&self) -> usize {
        self.frozen_bytes
    }

    /// Freeze everything written so far. The boundary only moves forward.
    pub fn freeze_written(&mut self) {
        assert!(self.write_pos >= self.frozen_bytes);
        self.frozen_bytes = self.write_pos;
    }

    /// Allocate a new label with a given name
    pub fn new_label(&mut self, name: String) -> usize {
        // This label doesn't have an address yet
        self.label_addrs.push(0);
        self.label_names.push(name);

        self.label_addrs.len() - 1
    }

    /// Write a label at the current address
    pub fn write_label(&mut self, label_idx: usize) {
        assert!(label_idx < self.label_addrs.len());
        self.label_addrs[label_idx] = self.write_pos;
    }

    // Add a label reference at the current write position and reserve
    // space for the 32-bit displacement
    pub fn label_ref(&mut self, label_idx: usize) {
        assert!(label_idx < self.label_addrs.len());

        self.label_refs.push(LabelRef {
            pos: self.write_pos,
            label_idx,
        });

        // Placeholder, patched by link_labels()
        self.write_int(0, 32);
    }

    // Resolve all label references written since the last link.
    // Labels are single-use: the table is cleared afterwards.
    pub fn link_labels(&mut self) {
        let orig_pos = self.write_pos;

        for label_ref in mem::take(&mut self.label_refs) {
            let ref_pos = label_ref.pos;
            assert!(ref_pos < self.mem_size);

            let label_addr = self.label_addrs[label_ref.label_idx];
            assert!(label_addr < self.mem_size);

            // Offset from the end of the 32-bit displacement to the label
            let offset = (label_addr as i64) - ((ref_pos + 4) as i64);

            self.set_pos(ref_pos);
            self.write_int(offset as u64, 32);
        }

        self.write_pos = orig_pos;

        self.label_addrs.clear();
        self.label_names.clear();
        assert!(self.label_refs.is_empty());
    }

    /// Make the page containing `write_pos` writable if it isn't already.
    pub fn mark_position_writable(&mut self, write_pos: usize) {
        let page_size = self.page_size;
        let aligned_position = (write_pos / page_size) * page_size;

        if self.current_aligned_write_pos != aligned_position {
            self.current_aligned_write_pos = aligned_position;

            if self.protected {
                let page_ptr = self.get_ptr(aligned_position).raw_ptr() as *mut u8;
                if let Err(err) = memory::mark_writable(page_ptr, page_size) {
                    panic!("failed to make code page writable: {}", err);
                }
            }
        }
    }

    /// Make the whole block writable at once, for bulk patching.
    pub fn mark_all_writable(&mut self) {
        self.current_aligned_write_pos = ALIGNED_WRITE_POSITION_NONE;

        if self.protected {
            let start = self.get_ptr(0).raw_ptr() as *mut u8;
            if let Err(err) = memory::mark_writable(start, self.mem_size) {
                panic!("failed to make code block writable: {}", err);
            }
        }
    }

    /// Seal the whole block: read + execute only.
    pub fn mark_all_executable(&mut self) {
        self.current_aligned_write_pos = ALIGNED_WRITE_POSITION_NONE;

        if self.protected {
            // The block may start mid-page; mprotect ranges are page
            // rounded by the kernel, which is fine for a shared mapping
            // that is entirely code.
            let start = self.get_ptr(0).raw_ptr() as *mut u8;
            if let Err(err) = memory::mark_executable(start, self.mem_size) {
                panic!("failed to make code block executable: {}", err);
            }
        }
    }
}

/// Wrapper so the type system distinguishes the inline and outlined
/// code blocks.
pub struct OutlinedCb {
    // This must remain private
    cb: CodeBlock,
}

impl OutlinedCb {
    pub fn wrap(cb: CodeBlock) -> Self {
        OutlinedCb { cb }
    }

    pub fn unwrap(&mut self) -> &mut CodeBlock {
        &mut self.cb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_cursor() {
        let mut cb = CodeBlock::new_dummy(64);
        cb.write_bytes(&[1, 2, 3]);
        assert_eq!(cb.get_write_pos(), 3);

        cb.set_pos(1);
        cb.write_byte(9);
        assert_eq!(cb.read_u64_at(0) & 0xff_ffff, 0x03_0901);
    }

    #[test]
    fn test_capacity_exhaustion_sets_dropped_bytes() {
        let mut cb = CodeBlock::new_dummy(4);
        cb.write_bytes(&[0; 8]);
        assert!(cb.has_dropped_bytes());
        // The cursor never runs past the end
        assert_eq!(cb.get_write_pos(), 4);
    }

    #[test]
    fn test_label_link_forward_and_backward() {
        let mut cb = CodeBlock::new_dummy(64);

        let start = cb.new_label("start".to_owned());
        cb.write_label(start);
        cb.write_byte(0x90);

        let end = cb.new_label("end".to_owned());
        // Forward ref to `end`, backward ref to `start`
        cb.label_ref(end);
        cb.label_ref(start);
        cb.write_label(end);
        cb.link_labels();

        // First ref at pos 1: end addr is 9, rel = 9 - (1 + 4) = 4
        assert_eq!(cb.read_u64_at(1) as u32, 4);
        // Second ref at pos 5: start addr is 0, rel = 0 - (5 + 4) = -9
        assert_eq!(cb.read_u64_at(5) as u32, (-9i32) as u32);
        // Cursor is back where linking started
        assert_eq!(cb.get_write_pos(), 9);
    }

    #[test]
    fn test_align_pos() {
        let mut cb = CodeBlock::new_dummy(4096);
        cb.write_byte(0x90);
        let before = cb.get_write_ptr().raw_ptr() as usize;
        cb.align_pos(8);
        let after = cb.get_write_ptr().raw_ptr() as usize;
        assert_eq!(after % 8, 0);
        assert!(after >= before);
    }

    #[test]
    fn test_freeze_boundary_only_grows() {
        let mut cb = CodeBlock::new_dummy(64);
        cb.write_bytes(&[0; 10]);
        cb.freeze_written();
        assert_eq!(cb.get_frozen_bytes(), 10);
        cb.write_bytes(&[0; 10]);
        cb.freeze_written();
        assert_eq!(cb.get_frozen_bytes(), 20);
    }
}
