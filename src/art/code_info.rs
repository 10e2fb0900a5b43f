//! Decoder for ART's CodeInfo blob, the compressed metadata the optimizing
//! compiler emits next to each method's machine code. The blob is a bit
//! stream: a group of interleaved varints for the header fields, then a set
//! of bit-packed tables gated by a presence mask. We decode the header plus
//! the tables needed to map native PCs to dex PCs and to materialize dex
//! registers; the rest are skipped over by their recorded sizes.
use crate::core::arch::Machine;
use crate::core::{CoreError, Result};
use std::collections::BTreeMap;

/// Values 0..=11 fit in the 4-bit varint header directly; 12..=15 mean the
/// value follows as 1..=4 whole bytes.
const VARINT_MAX: u32 = 11;

/// A value column stores `value + 1`, so "no value" (-1) packs to zero.
pub const NO_VALUE: u32 = u32::MAX;

/// Compiled frames are always multiples of this.
const STACK_ALIGNMENT: u32 = 16;

pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> BitReader<'a> {
        BitReader { data, pos: 0 }
    }

    /// Read up to 32 bits, least significant bit first.
    pub fn read_bits(&mut self, count: u32) -> Result<u32> {
        debug_assert!(count <= 32);
        let mut value: u32 = 0;
        for i in 0..count {
            let bit = self.pos + i as usize;
            let byte = self
                .data
                .get(bit / 8)
                .ok_or_else(|| CoreError::InvalidElf {
                    reason: "code info ran out of bits".to_string(),
                })?;
            value |= (((byte >> (bit % 8)) & 1) as u32) << i;
        }
        self.pos += count as usize;
        Ok(value)
    }

    /// N varints whose 4-bit headers come first, followed by the spilled
    /// byte payloads in the same order.
    pub fn read_varints(&mut self, count: usize) -> Result<Vec<u32>> {
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.read_bits(4)?);
        }
        for value in values.iter_mut() {
            if *value > VARINT_MAX {
                *value = self.read_bits((*value - VARINT_MAX) * 8)?;
            }
        }
        Ok(values)
    }
}

/// One bit-packed table: a row count, per-column bit widths, then the rows.
pub struct BitTable {
    num_rows: u32,
    column_bits: Vec<u32>,
    values: Vec<u32>,
}

impl BitTable {
    fn decode(reader: &mut BitReader, num_columns: usize) -> Result<BitTable> {
        let header = reader.read_varints(1 + num_columns)?;
        let num_rows = header[0];
        let column_bits = header[1..].to_vec();

        let mut values = Vec::with_capacity(num_rows as usize * num_columns);
        for _ in 0..num_rows {
            for bits in &column_bits {
                values.push(reader.read_bits(*bits)?);
            }
        }
        Ok(BitTable {
            num_rows,
            column_bits,
            values,
        })
    }

    fn empty(num_columns: usize) -> BitTable {
        BitTable {
            num_rows: 0,
            column_bits: vec![0; num_columns],
            values: Vec::new(),
        }
    }

    pub fn num_rows(&self) -> u32 {
        self.num_rows
    }

    /// Biased read: a stored zero means "no value". Out-of-range rows read
    /// as "no value" too; indexes come straight from target data.
    pub fn get(&self, row: u32, column: usize) -> u32 {
        if row >= self.num_rows {
            return NO_VALUE;
        }
        let index = row as usize * self.column_bits.len() + column;
        self.values.get(index).copied().unwrap_or(0).wrapping_sub(1)
    }
}

// StackMap columns.
const COL_KIND: usize = 0;
const COL_PACKED_NATIVE_PC: usize = 1;
const COL_DEX_PC: usize = 2;
const COL_DEX_REGISTER_MASK_INDEX: usize = 6;
const COL_DEX_REGISTER_MAP_INDEX: usize = 7;

/// Where a dex register's value lives in the frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DexRegisterKind {
    None,
    InStack,
    Constant,
    InRegister,
    InRegisterHigh,
    InFpuRegister,
    InFpuRegisterHigh,
}

impl DexRegisterKind {
    fn from_raw(raw: u32) -> DexRegisterKind {
        match raw {
            1 => DexRegisterKind::InStack,
            2 => DexRegisterKind::Constant,
            3 => DexRegisterKind::InRegister,
            4 => DexRegisterKind::InRegisterHigh,
            5 => DexRegisterKind::InFpuRegister,
            6 => DexRegisterKind::InFpuRegisterHigh,
            _ => DexRegisterKind::None,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DexRegisterInfo {
    pub kind: DexRegisterKind,
    pub value: u32,
}

pub struct CodeInfo {
    pub flags: u32,
    pub code_size: u32,
    pub packed_frame_size: u32,
    pub core_spill_mask: u32,
    pub fp_spill_mask: u32,
    pub number_of_dex_registers: u32,
    pub bit_table_flags: u32,
    stack_maps: BitTable,
    dex_register_masks: BitTable,
    dex_register_maps: BitTable,
    dex_register_catalog: BitTable,
}

/// The tables in blob order with their column counts. MethodInfos grew two
/// columns when the OAT version rolled past 238.
fn table_columns(oat_version: u32) -> [usize; 8] {
    let method_info_cols = if oat_version >= 239 { 3 } else { 1 };
    [8, 2, 1, 6, method_info_cols, 1, 1, 2]
}

impl CodeInfo {
    pub fn decode(bytes: &[u8], oat_version: u32) -> Result<CodeInfo> {
        let mut reader = BitReader::new(bytes);
        let header = reader.read_varints(7)?;
        let bit_table_flags = header[6];

        let columns = table_columns(oat_version);
        let mut tables: [Option<BitTable>; 8] = Default::default();
        for (i, num_columns) in columns.iter().enumerate() {
            if bit_table_flags & (1 << i) != 0 {
                tables[i] = Some(BitTable::decode(&mut reader, *num_columns)?);
            }
        }

        let mut take = |i: usize| tables[i].take().unwrap_or_else(|| BitTable::empty(columns[i]));
        Ok(CodeInfo {
            flags: header[0],
            code_size: header[1],
            packed_frame_size: header[2],
            core_spill_mask: header[3],
            fp_spill_mask: header[4],
            number_of_dex_registers: header[5],
            bit_table_flags,
            stack_maps: take(0),
            dex_register_masks: take(5),
            dex_register_maps: take(6),
            dex_register_catalog: take(7),
        })
    }

    pub fn frame_size_in_bytes(&self) -> u32 {
        self.packed_frame_size * STACK_ALIGNMENT
    }

    fn native_pc(&self, row: u32, machine: Machine) -> u32 {
        self.stack_maps.get(row, COL_PACKED_NATIVE_PC) * machine.instruction_alignment()
    }

    /// The stack map covering a native PC offset: the one with the greatest
    /// recorded PC at or below it.
    fn stack_map_for_native_pc(&self, native_pc: u32, machine: Machine) -> Option<u32> {
        let mut best: Option<(u32, u32)> = None;
        for row in 0..self.stack_maps.num_rows() {
            if self.stack_maps.get(row, COL_KIND) == NO_VALUE {
                continue;
            }
            let pc = self.native_pc(row, machine);
            if pc <= native_pc && best.is_none_or(|(_, b)| pc >= b) {
                best = Some((row, pc));
            }
        }
        best.map(|(row, _)| row)
    }

    pub fn native_pc_to_dex_pc(&self, native_pc: u32, machine: Machine) -> Result<u32> {
        let row = self
            .stack_map_for_native_pc(native_pc, machine)
            .ok_or_else(|| CoreError::not_found(format!("stack map for pc 0x{native_pc:x}")))?;
        Ok(self.stack_maps.get(row, COL_DEX_PC))
    }

    /// Materialize the dex registers recorded at a native PC. Registers the
    /// compiler didn't record don't appear in the map.
    pub fn native_pc_to_vregs(
        &self,
        native_pc: u32,
        machine: Machine,
    ) -> Result<BTreeMap<u16, DexRegisterInfo>> {
        let row = self
            .stack_map_for_native_pc(native_pc, machine)
            .ok_or_else(|| CoreError::not_found(format!("stack map for pc 0x{native_pc:x}")))?;

        let mut vregs = BTreeMap::new();
        let mask_index = self.stack_maps.get(row, COL_DEX_REGISTER_MASK_INDEX);
        let map_index = self.stack_maps.get(row, COL_DEX_REGISTER_MAP_INDEX);
        if mask_index == NO_VALUE || map_index == NO_VALUE {
            return Ok(vregs);
        }

        let mask = self.dex_register_masks.get(mask_index, 0);
        let mut entry = map_index;
        for vreg in 0..32u16 {
            if mask & (1 << vreg) == 0 {
                continue;
            }
            let catalog_index = self.dex_register_maps.get(entry, 0);
            entry += 1;
            if catalog_index == NO_VALUE {
                continue;
            }
            vregs.insert(
                vreg,
                DexRegisterInfo {
                    kind: DexRegisterKind::from_raw(self.dex_register_catalog.get(catalog_index, 0)),
                    value: self.dex_register_catalog.get(catalog_index, 1),
                },
            );
        }
        Ok(vregs)
    }
}
