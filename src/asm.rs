//! Instruction encoding.
//!
//! Recipes never depend on a concrete encoder: they go through the
//! [`Assembler`] trait, which closures implement as well, so tests can
//! hand in fixed byte sequences. [`Thumb`] is the built-in encoder and
//! knows only the Thumb-2 forms the recipe catalogue uses.

use snafu::Snafu;

#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub enum EncodeError {
    #[snafu(display("unknown mnemonic {:?}", mnemonic))]
    UnknownMnemonic { mnemonic: String },

    #[snafu(display("bad operand {:?} in {:?}", operand, line))]
    BadOperand { operand: String, line: String },

    #[snafu(display("{} out of range in {:?}", value, line))]
    OutOfRange { value: i64, line: String },

    #[snafu(display("{} is not halfword aligned", value))]
    Unaligned { value: i64 },
}

/// Turns assembly source into machine code.
///
/// `source` may hold several instructions separated by newlines or `;`.
/// The program is assembled at address 0, so a branch immediate is the
/// target's distance from the first instruction of `source`.
pub trait Assembler {
    fn assemble(&self, source: &str) -> Result<Vec<u8>, EncodeError>;
}

impl<F> Assembler for F
where
    F: Fn(&str) -> Result<Vec<u8>, EncodeError>,
{
    fn assemble(&self, source: &str) -> Result<Vec<u8>, EncodeError> {
        self(source)
    }
}

/// Thumb-2 (ARMv7-M) encoder for a fixed set of instruction forms.
#[derive(Debug, Clone, Copy, Default)]
pub struct Thumb;

impl Assembler for Thumb {
    fn assemble(&self, source: &str) -> Result<Vec<u8>, EncodeError> {
        let mut out = Vec::new();
        let mut pc: i64 = 0;
        for line in source.split(|c| c == '\n' || c == ';') {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let halfwords = encode_line(line, pc)?;
            for hw in &halfwords {
                out.extend_from_slice(&hw.to_le_bytes());
            }
            pc += 2 * halfwords.len() as i64;
        }
        Ok(out)
    }
}

const CONDITIONS: [&str; 14] = [
    "eq", "ne", "cs", "cc", "mi", "pl", "vs", "vc", "hi", "ls", "ge", "lt", "gt", "le",
];

fn encode_line(line: &str, pc: i64) -> Result<Vec<u16>, EncodeError> {
    let lower = line.to_ascii_lowercase();
    let (mnemonic, rest) = match lower.split_once(char::is_whitespace) {
        Some((m, r)) => (m, r.trim()),
        None => (lower.as_str(), ""),
    };
    let ops = Operands::new(rest, line);

    match mnemonic {
        "nop" => Ok(vec![0xbf00]),
        "nop.w" => Ok(vec![0xf3af, 0x8000]),
        "b" | "b.n" => {
            let disp = branch_displacement(ops.imm(0)?, pc, -2048, 2046, line)?;
            Ok(vec![0xe000 | ((disp >> 1) as u16 & 0x07ff)])
        }
        "movs" => {
            let rd = ops.low_reg(0)?;
            let imm = ops.imm_in(1, 0, 0xff)?;
            Ok(vec![0x2000 | rd << 8 | imm as u16])
        }
        "cmp" => {
            let rn = ops.low_reg(0)?;
            let imm = ops.imm_in(1, 0, 0xff)?;
            Ok(vec![0x2800 | rn << 8 | imm as u16])
        }
        "muls" => {
            let rd = ops.low_reg(0)?;
            let rn = ops.low_reg(1)?;
            let rm = if ops.items.len() > 2 { ops.low_reg(2)? } else { rd };
            // the narrow form needs the destination as one of the factors
            let factor = if rm == rd {
                rn
            } else if rn == rd {
                rm
            } else {
                return Err(ops.bad(ops.get(2)?));
            };
            Ok(vec![0x4340 | factor << 3 | rd])
        }
        "lsrs" => {
            let rd = ops.low_reg(0)?;
            let (rm, shift) = if ops.items.len() > 2 {
                (ops.low_reg(1)?, ops.imm_in(2, 1, 32)?)
            } else {
                (rd, ops.imm_in(1, 1, 32)?)
            };
            Ok(vec![0x0800 | ((shift & 0x1f) as u16) << 6 | rm << 3 | rd])
        }
        "movw" => {
            let rd = ops.wide_reg(0)?;
            let imm = ops.imm_in(1, 0, 0xffff)? as u16;
            Ok(vec![
                0xf240 | (imm >> 11 & 1) << 10 | imm >> 12,
                (imm >> 8 & 7) << 12 | rd << 8 | (imm & 0xff),
            ])
        }
        "mov.w" => {
            let rd = ops.wide_reg(0)?;
            let imm = ops.imm_in(1, 0, i64::from(u32::MAX))? as u32;
            let imm12 = modified_immediate(imm).ok_or_else(|| out_of_range(imm.into(), line))?;
            Ok(vec![
                0xf04f | (imm12 >> 11 & 1) << 10,
                (imm12 >> 8 & 7) << 12 | rd << 8 | (imm12 & 0xff),
            ])
        }
        "ldrb" => {
            let rt = ops.low_reg(0)?;
            let (rn, imm) = ops.mem(1)?;
            let imm = check_range(imm, 0, 31, line)?;
            Ok(vec![0x7800 | (imm as u16) << 6 | rn.low(line)? << 3 | rt])
        }
        "strh" => {
            let rt = ops.low_reg(0)?;
            let (rn, imm) = ops.mem(1)?;
            let imm = check_range(imm, 0, 62, line)?;
            if imm % 2 != 0 {
                return UnalignedSnafu { value: imm }.fail();
            }
            Ok(vec![0x8000 | ((imm / 2) as u16) << 6 | rn.low(line)? << 3 | rt])
        }
        "ldrb.w" | "strb.w" | "strh.w" => {
            let opcode = match mnemonic {
                "ldrb.w" => 0xf890,
                "strb.w" => 0xf880,
                _ => 0xf8a0,
            };
            let rt = ops.reg(0)?;
            let (rn, imm) = ops.mem(1)?;
            let imm = check_range(imm, 0, 0xfff, line)?;
            Ok(vec![opcode | rn.0, rt << 12 | imm as u16])
        }
        m if m.len() == 3 && m.starts_with('b') => {
            let cond = CONDITIONS
                .iter()
                .position(|c| *c == &m[1..])
                .ok_or_else(|| unknown(mnemonic))?;
            let disp = branch_displacement(ops.imm(0)?, pc, -256, 254, line)?;
            Ok(vec![0xd000 | (cond as u16) << 8 | (disp >> 1) as u16 & 0xff])
        }
        _ => Err(unknown(mnemonic)),
    }
}

/// The encoded displacement is relative to the pipeline PC, four bytes
/// past the branch.
fn branch_displacement(target: i64, pc: i64, min: i64, max: i64, line: &str) -> Result<i64, EncodeError> {
    let disp = target - pc - 4;
    if disp % 2 != 0 {
        return UnalignedSnafu { value: target }.fail();
    }
    check_range(disp, min, max, line)
}

/// `ThumbExpandImm` inverse: the 12-bit `i:imm3:imm8` field for `value`.
fn modified_immediate(value: u32) -> Option<u16> {
    let [b0, b1, b2, b3] = value.to_le_bytes();
    if value <= 0xff {
        return Some(value as u16);
    }
    if b1 == 0 && b3 == 0 && b0 == b2 {
        return Some(0x100 | u16::from(b0));
    }
    if b0 == 0 && b2 == 0 && b1 == b3 {
        return Some(0x200 | u16::from(b1));
    }
    if b0 == b1 && b1 == b2 && b2 == b3 {
        return Some(0x300 | u16::from(b0));
    }
    (8..32u32).find_map(|rot| {
        let unrotated = value.rotate_left(rot);
        (0x80..=0xff)
            .contains(&unrotated)
            .then(|| (rot << 7) as u16 | (unrotated & 0x7f) as u16)
    })
}

fn check_range(value: i64, min: i64, max: i64, line: &str) -> Result<i64, EncodeError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(out_of_range(value, line))
    }
}

fn out_of_range(value: i64, line: &str) -> EncodeError {
    OutOfRangeSnafu { value, line }.build()
}

fn unknown(mnemonic: &str) -> EncodeError {
    UnknownMnemonicSnafu { mnemonic }.build()
}

struct Reg(u16);

impl Reg {
    fn low(&self, line: &str) -> Result<u16, EncodeError> {
        if self.0 < 8 {
            Ok(self.0)
        } else {
            BadOperandSnafu {
                operand: format!("r{}", self.0),
                line,
            }
            .fail()
        }
    }
}

struct Operands<'a> {
    items: Vec<&'a str>,
    line: &'a str,
}

impl<'a> Operands<'a> {
    /// Splits on commas outside `[...]`.
    fn new(rest: &'a str, line: &'a str) -> Self {
        let mut items = Vec::new();
        let mut depth = 0;
        let mut start = 0;
        for (i, c) in rest.char_indices() {
            match c {
                '[' => depth += 1,
                ']' => depth -= 1,
                ',' if depth == 0 => {
                    items.push(rest[start..i].trim());
                    start = i + 1;
                }
                _ => {}
            }
        }
        if !rest[start..].trim().is_empty() {
            items.push(rest[start..].trim());
        }
        Operands { items, line }
    }

    fn get(&self, i: usize) -> Result<&'a str, EncodeError> {
        self.items.get(i).copied().ok_or_else(|| self.bad("<missing>"))
    }

    fn bad(&self, operand: &str) -> EncodeError {
        BadOperandSnafu {
            operand,
            line: self.line,
        }
        .build()
    }

    fn reg(&self, i: usize) -> Result<u16, EncodeError> {
        let op = self.get(i)?;
        parse_reg(op).map(|r| r.0).ok_or_else(|| self.bad(op))
    }

    fn low_reg(&self, i: usize) -> Result<u16, EncodeError> {
        let op = self.get(i)?;
        parse_reg(op)
            .ok_or_else(|| self.bad(op))?
            .low(self.line)
    }

    /// Registers usable by 32-bit data-processing forms (not sp or pc).
    fn wide_reg(&self, i: usize) -> Result<u16, EncodeError> {
        let r = self.reg(i)?;
        if r == 13 || r == 15 {
            return Err(self.bad(self.get(i)?));
        }
        Ok(r)
    }

    fn imm(&self, i: usize) -> Result<i64, EncodeError> {
        let op = self.get(i)?;
        parse_imm(op).ok_or_else(|| self.bad(op))
    }

    fn imm_in(&self, i: usize, min: i64, max: i64) -> Result<i64, EncodeError> {
        check_range(self.imm(i)?, min, max, self.line)
    }

    /// `[rn]` or `[rn, #imm]`.
    fn mem(&self, i: usize) -> Result<(Reg, i64), EncodeError> {
        let op = self.get(i)?;
        let inner = op
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(|| self.bad(op))?;
        let (base, offset) = match inner.split_once(',') {
            Some((b, o)) => (b.trim(), parse_imm(o.trim()).ok_or_else(|| self.bad(op))?),
            None => (inner.trim(), 0),
        };
        let rn = parse_reg(base).ok_or_else(|| self.bad(op))?;
        Ok((rn, offset))
    }
}

fn parse_reg(op: &str) -> Option<Reg> {
    let n = match op {
        "sp" => 13,
        "lr" => 14,
        "pc" => 15,
        _ => op.strip_prefix('r')?.parse().ok()?,
    };
    (n < 16).then(|| Reg(n))
}

fn parse_imm(op: &str) -> Option<i64> {
    let op = op.strip_prefix('#').unwrap_or(op);
    let (negative, digits) = match op.strip_prefix('-') {
        Some(d) => (true, d),
        None => (false, op),
    };
    let value = match digits.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse().ok()?,
    };
    Some(if negative { -value } else { value })
}
