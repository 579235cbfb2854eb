//! The packed-decimal engine.
//!
//! Operands are up to 16 bytes (31 digits and a sign). Every instruction
//! unpacks into a 31-byte digit buffer, works on digits, and repacks.
//! Divide is a scaled long division: both operands are multiplied so the
//! divisor's high digit is at least 5, quotient digits are estimated and
//! corrected by at most one, and the remainder is unscaled at the end.

use crate::cpu::Cpu;
use crate::dat::{AccType, Space};
use crate::decode::{ss_l, ss_ll};
use crate::fault::{
    Fault, PGM_DATA, PGM_DECIMAL_DIVIDE, PGM_DECIMAL_OVERFLOW, PGM_SPECIFICATION,
};

/// Maximum packed operand length in bytes.
pub const MAX_DECIMAL_LENGTH: usize = 16;
/// Maximum number of decimal digits in an operand.
pub const MAX_DECIMAL_DIGITS: usize = MAX_DECIMAL_LENGTH * 2 - 1;

type Digits = [u8; MAX_DECIMAL_DIGITS];

/// Unpacked operand: digit buffer, significant-digit count, sign.
#[derive(Debug, Clone, Copy)]
struct Decimal {
    digits: Digits,
    count: usize,
    sign: i32,
}

/// Add two digit strings as unsigned numbers. The returned count is
/// `MAX_DECIMAL_DIGITS + 1` on a carry out of the leftmost digit.
fn add_decimal(dec1: &Digits, dec2: &Digits) -> (Digits, usize) {
    let mut result = [0u8; MAX_DECIMAL_DIGITS];
    let mut count = 0;
    let mut carry = 0;
    for i in (0..MAX_DECIMAL_DIGITS).rev() {
        let mut d = dec1[i] + dec2[i] + carry;
        if d > 9 {
            d -= 10;
            carry = 1;
        } else {
            carry = 0;
        }
        if d != 0 {
            count = MAX_DECIMAL_DIGITS - i;
        }
        result[i] = d;
    }
    if carry != 0 {
        count = MAX_DECIMAL_DIGITS + 1;
    }
    (result, count)
}

/// Subtract two digit strings as unsigned numbers; the sign reports which
/// operand was larger.
fn subtract_decimal(dec1: &Digits, dec2: &Digits) -> (Digits, usize, i32) {
    let mut result = [0u8; MAX_DECIMAL_DIGITS];
    let (higher, lower, sign) = match dec1.cmp(dec2) {
        std::cmp::Ordering::Equal => return (result, 0, 1),
        std::cmp::Ordering::Greater => (dec1, dec2, 1),
        std::cmp::Ordering::Less => (dec2, dec1, -1),
    };
    let mut count = 0;
    let mut borrow = 0i32;
    for i in (0..MAX_DECIMAL_DIGITS).rev() {
        let mut d = i32::from(higher[i]) - i32::from(lower[i]) - borrow;
        if d < 0 {
            d += 10;
            borrow = 1;
        } else {
            borrow = 0;
        }
        if d != 0 {
            count = MAX_DECIMAL_DIGITS - i;
        }
        result[i] = d as u8;
    }
    (result, count, sign)
}

/// Long division on digit strings. The caller has verified that overflow
/// cannot occur, the divisor is non-zero, and the dividend has at least
/// one high-order zero.
fn divide_decimal(dec1: &Digits, count1: usize, dec2: &Digits, count2: usize) -> (Digits, Digits) {
    let mut quot = [0u8; MAX_DECIMAL_DIGITS];
    let mut rem = [0u8; MAX_DECIMAL_DIGITS];

    if count1 == 0 {
        return (quot, rem);
    }
    if dec1[..] < dec2[..] {
        rem.copy_from_slice(dec1);
        return (quot, rem);
    }

    // Work on the significant digits, one leading zero on the dividend.
    let count1 = count1 + 1;
    let mut num1: Vec<i32> = dec1[MAX_DECIMAL_DIGITS - count1..]
        .iter()
        .map(|&d| i32::from(d))
        .collect();
    let mut num2: Vec<i32> = dec2[MAX_DECIMAL_DIGITS - count2..]
        .iter()
        .map(|&d| i32::from(d))
        .collect();

    // Scale so the divisor's first digit is at least 5; quotient-digit
    // estimates are then off by at most one.
    let scale = 10 / (num2[0] + 1);
    if scale > 1 {
        let mut flag = 0;
        for d in num1.iter_mut().rev() {
            let div = flag + scale * *d;
            *d = div % 10;
            flag = div / 10;
        }
        flag = 0;
        for d in num2.iter_mut().rev() {
            let div = flag + scale * *d;
            *d = div % 10;
            flag = div / 10;
        }
    }

    for index1 in 0..count1 - count2 {
        // Estimate the quotient digit from the leading digits.
        let mut qtest = if num2[0] == num1[index1] {
            9
        } else {
            let temp2 = if index1 + 1 < count1 { num1[index1 + 1] } else { 0 };
            (10 * num1[index1] + temp2) / num2[0]
        };
        let temp2 = num1[index1];
        let temp4 = num2[0];
        let temp1 = if count2 >= 2 { num2[1] } else { 0 };
        let (temp3, temp5) = if index1 + 1 < count1 {
            (
                num1[index1 + 1],
                if index1 + 2 < count1 { num1[index1 + 2] } else { 0 },
            )
        } else {
            (0, 0)
        };
        while qtest * temp1 > 10 * (10 * temp2 + temp3 - qtest * temp4) + temp5 {
            qtest -= 1;
        }

        // Multiply-and-subtract the divisor at this position.
        let mut flag = 0;
        let mut index2 = count2 as i32 - 1;
        for index in (index1..=index1 + count2).rev() {
            if index2 >= 0 {
                flag -= qtest * num2[index2 as usize];
            }
            let mut div = flag + num1[index];
            if div < 0 {
                flag = div / 10;
                div %= 10;
                if div < 0 {
                    div += 10;
                    flag -= 1;
                }
            } else {
                flag = 0;
            }
            num1[index] = div;
            index2 -= 1;
        }

        let indexq = MAX_DECIMAL_DIGITS - (count1 - count2) + index1;
        if flag != 0 {
            // The estimate was one too high; add the divisor back.
            quot[indexq] = (qtest - 1) as u8;
            let mut flag = 0;
            let mut index2 = count2 as i32 - 1;
            for index in (index1..=index1 + count2).rev() {
                if index2 >= 0 {
                    flag += num2[index2 as usize];
                }
                let mut div = flag + num1[index];
                if div > 9 {
                    div -= 10;
                    flag = 1;
                } else {
                    flag = 0;
                }
                num1[index] = div;
                index2 -= 1;
            }
        } else {
            quot[indexq] = qtest as u8;
        }
    }

    // Unscale the remainder.
    let mut flag = 0;
    let mut indexr = MAX_DECIMAL_DIGITS - count2;
    for &d in num1.iter().take(count1).skip(count1 - count2) {
        let div = d + 10 * flag;
        rem[indexr] = (div / scale) as u8;
        flag = div % scale;
        indexr += 1;
    }

    (quot, rem)
}

impl Cpu {
    /// Unpack a packed-decimal operand; bad digits or sign are a data
    /// exception.
    fn load_decimal(&mut self, addr: u64, len: usize, space: Space) -> Result<Decimal, Fault> {
        let mut pack = [0u8; MAX_DECIMAL_LENGTH];
        self.vfetchc(&mut pack[MAX_DECIMAL_LENGTH - len - 1..], addr, space)?;

        let mut digits = [0u8; MAX_DECIMAL_DIGITS];
        let mut count = 0;
        let mut j = 0;
        for (i, out) in digits.iter_mut().enumerate() {
            let h = if i & 1 != 0 {
                let h = pack[j] & 0x0F;
                j += 1;
                h
            } else {
                pack[j] >> 4
            };
            if h > 9 {
                return Err(Fault(PGM_DATA));
            }
            if count > 0 || h != 0 {
                count += 1;
            }
            *out = h;
        }

        let h = pack[MAX_DECIMAL_LENGTH - 1] & 0x0F;
        if h < 0x0A {
            return Err(Fault(PGM_DATA));
        }
        Ok(Decimal {
            digits,
            count,
            sign: if h == 0x0B || h == 0x0D { -1 } else { 1 },
        })
    }

    /// Pack a digit buffer and store it at the operand location.
    fn store_decimal(
        &mut self,
        addr: u64,
        len: usize,
        space: Space,
        digits: &Digits,
        sign: i32,
    ) -> Result<(), Fault> {
        let mut pack = [0u8; MAX_DECIMAL_LENGTH];
        let mut j = 0;
        for (i, &d) in digits.iter().enumerate() {
            if i & 1 != 0 {
                pack[j] |= d;
                j += 1;
            } else {
                pack[j] = d << 4;
            }
        }
        pack[MAX_DECIMAL_LENGTH - 1] |= if sign < 0 { 0x0D } else { 0x0C };
        self.vstorec(&pack[MAX_DECIMAL_LENGTH - len - 1..], addr, space)
    }

    fn decimal_overflow_check(&self) -> Result<(), Fault> {
        if self.psw.cc == 3 && self.psw.domask() {
            return Err(Fault(PGM_DECIMAL_OVERFLOW));
        }
        Ok(())
    }

    /// FA: AP - Add Decimal.
    pub fn exec_ap(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        self.add_or_subtract_decimal(inst, false)
    }

    /// FB: SP - Subtract Decimal.
    pub fn exec_sp(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        self.add_or_subtract_decimal(inst, true)
    }

    fn add_or_subtract_decimal(&mut self, inst: &[u8; 6], negate2: bool) -> Result<(), Fault> {
        let (l1, l2, addr1, b1, addr2, b2) = ss_ll(self, inst);
        let op1 = self.load_decimal(addr1, l1, Space::Ar(b1 as u8))?;
        let mut op2 = self.load_decimal(addr2, l2, Space::Ar(b2 as u8))?;
        if negate2 {
            op2.sign = -op2.sign;
        }

        let (digits, count, mut sign) = if op2.count == 0 {
            (op1.digits, op1.count, op1.sign)
        } else if op1.count == 0 {
            (op2.digits, op2.count, op2.sign)
        } else if op1.sign == op2.sign {
            let (d, c) = add_decimal(&op1.digits, &op2.digits);
            (d, c, op1.sign)
        } else {
            let (d, c, s) = subtract_decimal(&op1.digits, &op2.digits);
            (d, c, if op1.sign < 0 { -s } else { s })
        };

        let mut cc = if count == 0 {
            0
        } else if sign < 1 {
            1
        } else {
            2
        };
        // Overflow when the result needs more digits than operand 1 holds.
        if count > (l1 + 1) * 2 - 1 {
            cc = 3;
        }
        if count == 0 {
            sign = 1;
        }
        self.store_decimal(addr1, l1, Space::Ar(b1 as u8), &digits, sign)?;
        self.psw.cc = cc;
        self.decimal_overflow_check()
    }

    /// F8: ZAP - Zero and Add.
    pub fn exec_zap(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (l1, l2, addr1, b1, addr2, b2) = ss_ll(self, inst);
        let op2 = self.load_decimal(addr2, l2, Space::Ar(b2 as u8))?;

        let mut cc = if op2.count == 0 {
            0
        } else if op2.sign < 1 {
            1
        } else {
            2
        };
        if op2.count > (l1 + 1) * 2 - 1 {
            cc = 3;
        }
        let sign = if op2.count == 0 { 1 } else { op2.sign };
        self.store_decimal(addr1, l1, Space::Ar(b1 as u8), &op2.digits, sign)?;
        self.psw.cc = cc;
        self.decimal_overflow_check()
    }

    /// F9: CP - Compare Decimal.
    pub fn exec_cp(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (l1, l2, addr1, b1, addr2, b2) = ss_ll(self, inst);
        let op1 = self.load_decimal(addr1, l1, Space::Ar(b1 as u8))?;
        let op2 = self.load_decimal(addr2, l2, Space::Ar(b2 as u8))?;

        self.psw.cc = if op1.count == 0 && op2.count == 0 {
            0
        } else if op1.sign < 0 && op2.sign > 0 {
            1
        } else if op1.sign > 0 && op2.sign < 0 {
            2
        } else {
            match op1.digits.cmp(&op2.digits) {
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Less => {
                    if op1.sign > 0 {
                        1
                    } else {
                        2
                    }
                }
                std::cmp::Ordering::Greater => {
                    if op1.sign > 0 {
                        2
                    } else {
                        1
                    }
                }
            }
        };
        Ok(())
    }

    /// FC: MP - Multiply Decimal.
    pub fn exec_mp(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (l1, l2, addr1, b1, addr2, b2) = ss_ll(self, inst);
        if l2 > 7 || l2 >= l1 {
            return Err(Fault(PGM_SPECIFICATION));
        }
        let op1 = self.load_decimal(addr1, l1, Space::Ar(b1 as u8))?;
        let op2 = self.load_decimal(addr2, l2, Space::Ar(b2 as u8))?;

        // The multiplicand must have enough leading zero bytes to make
        // overflow impossible.
        if l2 > l1 - (op1.count / 2 + 1) {
            return Err(Fault(PGM_DATA));
        }

        let mut result = [0u8; MAX_DECIMAL_DIGITS];
        for i2 in (0..MAX_DECIMAL_DIGITS).rev() {
            if op2.digits[i2] == 0 {
                continue;
            }
            let mut carry = 0u32;
            for i3 in (0..=i2).rev() {
                let i1 = MAX_DECIMAL_DIGITS - 1 - (i2 - i3);
                let d = carry
                    + u32::from(op1.digits[i1]) * u32::from(op2.digits[i2])
                    + u32::from(result[i3]);
                result[i3] = (d % 10) as u8;
                carry = d / 10;
            }
        }

        let sign = if op1.sign == op2.sign { 1 } else { -1 };
        self.store_decimal(addr1, l1, Space::Ar(b1 as u8), &result, sign)
    }

    /// FD: DP - Divide Decimal.
    pub fn exec_dp(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (l1, l2, addr1, b1, addr2, b2) = ss_ll(self, inst);
        if l2 > 7 || l2 >= l1 {
            return Err(Fault(PGM_SPECIFICATION));
        }
        let op1 = self.load_decimal(addr1, l1, Space::Ar(b1 as u8))?;
        let op2 = self.load_decimal(addr2, l2, Space::Ar(b2 as u8))?;

        if op2.count == 0 {
            return Err(Fault(PGM_DECIMAL_DIVIDE));
        }

        // Trial comparison: the divisor aligned one digit right of the
        // leftmost dividend digit must exceed the dividend prefix,
        // otherwise the quotient cannot fit.
        let d2 = &op2.digits[MAX_DECIMAL_DIGITS - l2 * 2 - 2..];
        let d1 = &op1.digits[MAX_DECIMAL_DIGITS - l1 * 2 - 1..MAX_DECIMAL_DIGITS - l1 * 2 - 1 + l2 * 2 + 2];
        if d2 <= d1 {
            return Err(Fault(PGM_DECIMAL_DIVIDE));
        }

        let (quot, rem) = divide_decimal(&op1.digits, op1.count, &op2.digits, op2.count);

        let signq = if op1.sign == op2.sign { 1 } else { -1 };
        let signr = op1.sign;

        // Remainder fills the whole first operand first (so the entire
        // field is store-checked), then the quotient overlays the left.
        self.store_decimal(addr1, l1, Space::Ar(b1 as u8), &rem, signr)?;
        self.store_decimal(addr1, l1 - l2 - 1, Space::Ar(b1 as u8), &quot, signq)
    }

    /// F0: SRP - Shift and Round Decimal.
    pub fn exec_srp(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let (l1, i3, addr1, b1, addr2, _) = ss_ll(self, inst);
        let op = self.load_decimal(addr1, l1, Space::Ar(b1 as u8))?;
        let i3 = i3 as u8;
        if i3 > 9 {
            return Err(Fault(PGM_DATA));
        }

        let shift = (addr2 & 0x3F) as usize;
        let mut dec = op.digits;
        let mut sign = op.sign;
        let cc;
        if shift < 32 {
            // Left shift.
            cc = {
                let mut cc = if op.count == 0 {
                    0
                } else if sign < 0 {
                    1
                } else {
                    2
                };
                if op.count > 0 && shift > (l1 + 1) * 2 - 1 - op.count {
                    cc = 3;
                }
                cc
            };
            for i in 0..MAX_DECIMAL_DIGITS {
                let j = i + shift;
                dec[i] = if j < MAX_DECIMAL_DIGITS { op.digits[j] } else { 0 };
            }
        } else {
            // Right shift by 64-n digits, rounding the first shifted-out
            // digit and propagating the carry.
            let shift = 64 - shift;
            let mut carry = if shift > MAX_DECIMAL_DIGITS {
                0
            } else {
                (u32::from(op.digits[MAX_DECIMAL_DIGITS - shift]) + u32::from(i3)) / 10
            };
            let mut count = 0;
            for i in (0..MAX_DECIMAL_DIGITS).rev() {
                let j = i as i32 - shift as i32;
                let mut d = if j >= 0 {
                    u32::from(op.digits[j as usize])
                } else {
                    0
                };
                d += carry;
                carry = d / 10;
                d %= 10;
                dec[i] = d as u8;
                if d != 0 {
                    count = MAX_DECIMAL_DIGITS - i;
                }
            }
            cc = if count == 0 {
                0
            } else if sign < 0 {
                1
            } else {
                2
            };
        }

        if cc == 0 {
            sign = 1;
        }
        self.store_decimal(addr1, l1, Space::Ar(b1 as u8), &dec, sign)?;
        self.psw.cc = cc;
        self.decimal_overflow_check()
    }

    /// DE: ED - Edit; DF: EDMK - Edit and Mark.
    ///
    /// A pattern crossing a protection boundary runs a trial pass first so
    /// a mid-pattern fault leaves the result field untouched.
    pub fn exec_ed(&mut self, inst: &[u8; 6]) -> Result<(), Fault> {
        let edmk = inst[0] == 0xDF;
        let (l, ea1, b1, ea2, b2) = ss_l(self, inst);
        let wrap = self.psw.address_wrap();

        let trial_first = ea1 & !0xFFF != (ea1 + l as u64) & !0xFFF;
        let mut cc = 0;
        let mut sig = false;

        let mut run = i32::from(trial_first);
        while run >= 0 {
            let trial = run > 0;
            let mut addr1 = ea1;
            let mut addr2 = ea2;
            cc = 0;
            sig = false;
            let mut sbyte = 0u8;
            let mut fbyte = 0u8;
            let mut right_digit = false;

            for i in 0..=l {
                let pbyte = self.vfetchb(addr1, Space::Ar(b1 as u8))?;
                if i == 0 {
                    fbyte = pbyte;
                }

                if pbyte == 0x20 || pbyte == 0x21 {
                    let h;
                    if right_digit {
                        h = sbyte;
                        right_digit = false;
                    } else {
                        sbyte = self.vfetchb(addr2, Space::Ar(b2 as u8))?;
                        h = sbyte >> 4;
                        sbyte &= 0x0F;
                        right_digit = true;
                        addr2 = (addr2 + 1) & wrap;
                        if h > 9 {
                            return Err(Fault(PGM_DATA));
                        }
                    }

                    // EDMK records the first significant result byte.
                    if !trial && edmk && h > 0 && !sig {
                        if self.psw.amode {
                            self.regs.set_gr_l(1, addr1 as u32);
                        } else {
                            let gr1 = self.regs.gr_l(1) & 0xFF00_0000 | addr1 as u32;
                            self.regs.set_gr_l(1, gr1);
                        }
                    }

                    let rbyte = if !sig && h == 0 { fbyte } else { 0xF0 | h };
                    if trial {
                        self.validate_operand(addr1, Space::Ar(b1 as u8), 1, AccType::Write)?;
                    } else {
                        self.vstoreb(rbyte, addr1, Space::Ar(b1 as u8))?;
                    }

                    if h > 0 {
                        cc = 2;
                    }
                    if pbyte == 0x21 || h > 0 {
                        sig = true;
                    }
                    // A sign code in the right digit ends the field.
                    if right_digit && sbyte > 9 {
                        if sbyte != 0x0B && sbyte != 0x0D {
                            sig = false;
                        }
                        right_digit = false;
                    }
                } else if pbyte == 0x22 {
                    if trial {
                        self.validate_operand(addr1, Space::Ar(b1 as u8), 1, AccType::Write)?;
                    } else {
                        self.vstoreb(fbyte, addr1, Space::Ar(b1 as u8))?;
                    }
                    sig = false;
                    cc = 0;
                } else if !sig {
                    if trial {
                        self.validate_operand(addr1, Space::Ar(b1 as u8), 1, AccType::Write)?;
                    } else {
                        self.vstoreb(fbyte, addr1, Space::Ar(b1 as u8))?;
                    }
                }

                addr1 = (addr1 + 1) & wrap;
            }
            run -= 1;
        }

        if sig && cc == 2 {
            cc = 1;
        }
        self.psw.cc = cc;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::real_cpu;

    fn put(cpu: &Cpu, addr: u64, bytes: &[u8]) {
        cpu.sysblk.storage().store_bytes_absolute(bytes, addr);
    }

    fn get(cpu: &Cpu, addr: u64, len: usize) -> Vec<u8> {
        let mut v = vec![0u8; len];
        cpu.sysblk.storage().fetch_bytes_absolute(&mut v, addr);
        v
    }

    /// SS instruction with two length nibbles, operands at GR1 and GR2.
    fn ss_inst(op: u8, l1: usize, l2: usize) -> [u8; 6] {
        [op, ((l1 as u8) << 4) | l2 as u8, 0x10, 0x00, 0x20, 0x00]
    }

    /// SS instruction with a single length byte (ED/EDMK).
    fn ss_inst_l(op: u8, l: usize) -> [u8; 6] {
        [op, l as u8, 0x10, 0x00, 0x20, 0x00]
    }

    fn decimal_cpu(a: &[u8], b: &[u8]) -> Cpu {
        let mut cpu = real_cpu(0x10_0000);
        put(&cpu, 0x1000, a);
        put(&cpu, 0x2000, b);
        cpu.regs.set_gr_l(1, 0x1000);
        cpu.regs.set_gr_l(2, 0x2000);
        cpu
    }

    #[test]
    fn ap_adds_positive_operands() {
        // 12345C + 00001C = 12346C, cc 2.
        let mut cpu = decimal_cpu(&[0x12, 0x34, 0x5C], &[0x00, 0x00, 0x1C]);
        cpu.exec_ap(&ss_inst(0xFA, 2, 2)).expect("AP");
        assert_eq!(get(&cpu, 0x1000, 3), vec![0x12, 0x34, 0x6C]);
        assert_eq!(cpu.psw.cc, 2);
    }

    #[test]
    fn ap_mixed_signs_subtracts() {
        // 00100C + 00250D = 00150D, cc 1.
        let mut cpu = decimal_cpu(&[0x00, 0x10, 0x0C], &[0x00, 0x25, 0x0D]);
        cpu.exec_ap(&ss_inst(0xFA, 2, 2)).expect("AP");
        assert_eq!(get(&cpu, 0x1000, 3), vec![0x00, 0x15, 0x0D]);
        assert_eq!(cpu.psw.cc, 1);
    }

    #[test]
    fn zap_then_ap_negation_gives_zero() {
        // ZAP d1,src; AP d1,-src → +0 with cc 0.
        let mut cpu = decimal_cpu(&[0, 0, 0], &[0x12, 0x34, 0x5C]);
        cpu.exec_zap(&ss_inst(0xF8, 2, 2)).expect("ZAP");
        assert_eq!(get(&cpu, 0x1000, 3), vec![0x12, 0x34, 0x5C]);
        // Overwrite the source with its negation.
        put(&cpu, 0x2000, &[0x12, 0x34, 0x5D]);
        cpu.exec_ap(&ss_inst(0xFA, 2, 2)).expect("AP");
        assert_eq!(get(&cpu, 0x1000, 3), vec![0x00, 0x00, 0x0C]);
        assert_eq!(cpu.psw.cc, 0);
    }

    #[test]
    fn ap_overflow_sets_cc3_and_checks_mask() {
        // 999C + 001C overflows a 2-byte field.
        let mut cpu = decimal_cpu(&[0x99, 0x9C], &[0x00, 0x1C]);
        cpu.exec_ap(&ss_inst(0xFA, 1, 1)).expect("AP overflow");
        assert_eq!(cpu.psw.cc, 3);
        // With the decimal-overflow mask on, the same add program-checks.
        put(&cpu, 0x1000, &[0x99, 0x9C]);
        cpu.psw.progmask = 0x4;
        let err = cpu.exec_ap(&ss_inst(0xFA, 1, 1)).expect_err("masked");
        assert_eq!(err, Fault(PGM_DECIMAL_OVERFLOW));
    }

    #[test]
    fn invalid_digit_is_data_exception() {
        let mut cpu = decimal_cpu(&[0x1A, 0x2C], &[0x00, 0x0C]);
        let err = cpu.exec_ap(&ss_inst(0xFA, 1, 1)).expect_err("bad digit");
        assert_eq!(err, Fault(PGM_DATA));
    }

    #[test]
    fn cp_compares_signed_magnitudes() {
        let mut cpu = decimal_cpu(&[0x00, 0x2C], &[0x00, 0x3C]);
        cpu.exec_cp(&ss_inst(0xF9, 1, 1)).expect("CP");
        assert_eq!(cpu.psw.cc, 1); // 2 < 3
        // Negative versus positive.
        put(&cpu, 0x1000, &[0x00, 0x2D]);
        cpu.exec_cp(&ss_inst(0xF9, 1, 1)).expect("CP");
        assert_eq!(cpu.psw.cc, 1);
        // Equal negative values.
        put(&cpu, 0x2000, &[0x00, 0x2D]);
        cpu.exec_cp(&ss_inst(0xF9, 1, 1)).expect("CP");
        assert_eq!(cpu.psw.cc, 0);
    }

    #[test]
    fn mp_multiplies() {
        // 00025C × 3C = 00075C. Operand 1 needs l2 leading zero bytes.
        let mut cpu = decimal_cpu(&[0x00, 0x02, 0x5C], &[0x3C]);
        cpu.exec_mp(&ss_inst(0xFC, 2, 0)).expect("MP");
        assert_eq!(get(&cpu, 0x1000, 3), vec![0x00, 0x07, 0x5C]);
    }

    #[test]
    fn dp_divides_with_quotient_and_remainder() {
        // 0001234C ÷ 5C: quotient 246C, remainder 4C.
        let mut cpu = decimal_cpu(&[0x00, 0x01, 0x23, 0x4C], &[0x5C]);
        cpu.exec_dp(&ss_inst(0xFD, 3, 0)).expect("DP");
        // First operand becomes quotient (l1-l2-1+1 = 3 bytes) then
        // remainder (1 byte): 00246C 4C.
        assert_eq!(get(&cpu, 0x1000, 4), vec![0x00, 0x24, 0x6C, 0x4C]);
    }

    #[test]
    fn dp_by_zero_is_decimal_divide() {
        let mut cpu = decimal_cpu(&[0x00, 0x01, 0x23, 0x4C], &[0x0C]);
        let err = cpu.exec_dp(&ss_inst(0xFD, 3, 0)).expect_err("divide by zero");
        assert_eq!(err, Fault(PGM_DECIMAL_DIVIDE));
    }

    #[test]
    fn dp_overflow_pre_check_fires_before_store() {
        // Dividend prefix ≥ shifted divisor: 9999C ÷ 1C would need a
        // quotient wider than the field.
        let mut cpu = decimal_cpu(&[0x99, 0x99, 0x9C], &[0x1C]);
        let err = cpu.exec_dp(&ss_inst(0xFD, 2, 0)).expect_err("overflow");
        assert_eq!(err, Fault(PGM_DECIMAL_DIVIDE));
        // Operand untouched.
        assert_eq!(get(&cpu, 0x1000, 3), vec![0x99, 0x99, 0x9C]);
    }

    #[test]
    fn srp_shifts_left_and_right() {
        // Left shift by 2: 00123C → 12300C.
        let mut cpu = decimal_cpu(&[0x00, 0x12, 0x3C], &[0]);
        let mut inst = ss_inst(0xF0, 2, 0);
        inst[1] = 0x20; // l1=2, i3=0
        inst[4] = 0x00;
        inst[5] = 0x02; // shift 2 (base 0, displacement 2)
        cpu.exec_srp(&inst).expect("SRP left");
        assert_eq!(get(&cpu, 0x1000, 3), vec![0x12, 0x30, 0x0C]);
        assert_eq!(cpu.psw.cc, 2);

        // Right shift by 1 with rounding digit 5: 12300C → 01230C.
        // Shift counts 32-63 shift right by 64-n; displacement 63 is one.
        let mut inst = ss_inst(0xF0, 2, 0);
        inst[1] = 0x25; // l1=2, rounding digit 5
        inst[4] = 0x00;
        inst[5] = 0x3F;
        cpu.exec_srp(&inst).expect("SRP right");
        assert_eq!(get(&cpu, 0x1000, 3), vec![0x01, 0x23, 0x0C]);
    }

    #[test]
    fn srp_right_shift_rounds() {
        // 00125C shifted right one digit with round 5 → 00013C.
        let mut cpu = decimal_cpu(&[0x00, 0x12, 0x5C], &[0]);
        let mut inst = ss_inst(0xF0, 2, 0);
        inst[1] = 0x25;
        inst[4] = 0x03;
        inst[5] = 0x3F;
        cpu.exec_srp(&inst).expect("SRP");
        assert_eq!(get(&cpu, 0x1000, 3), vec![0x00, 0x01, 0x3C]);
    }

    #[test]
    fn ed_formats_with_fill_and_significance() {
        // Pattern: fill '*', then five digit selectors (one is the
        // significance starter); source 0257(+). The plus sign turns the
        // significance indicator back off, so cc stays 2.
        let mut cpu = decimal_cpu(
            &[0x5C, 0x20, 0x20, 0x21, 0x20, 0x20],
            &[0x02, 0x57, 0x0C],
        );
        cpu.exec_ed(&ss_inst_l(0xDE, 5)).expect("ED");
        assert_eq!(
            get(&cpu, 0x1000, 6),
            vec![0x5C, 0x5C, 0xF2, 0xF5, 0xF7, 0xF0]
        );
        assert_eq!(cpu.psw.cc, 2);
    }

    #[test]
    fn edmk_marks_first_significant_byte() {
        let mut cpu = decimal_cpu(
            &[0x40, 0x20, 0x20, 0x20, 0x20],
            &[0x00, 0x31, 0x0C],
        );
        cpu.psw.amode = true;
        // GR1 is the operand base and doubles as the mark register.
        cpu.regs.set_gr_l(1, 0x1000);
        cpu.regs.set_gr_l(2, 0x2000);
        cpu.exec_ed(&ss_inst_l(0xDF, 4)).expect("EDMK");
        // First non-zero digit (3) lands at offset 3 of the pattern.
        assert_eq!(cpu.regs.gr_l(1), 0x1003);
    }

    #[test]
    fn edmk_leaves_gr1_for_insignificant_result() {
        let mut cpu = decimal_cpu(&[0x40, 0x20, 0x20], &[0x00, 0x0C]);
        cpu.regs.set_gr_l(1, 0x1000);
        cpu.exec_ed(&ss_inst_l(0xDF, 2)).expect("EDMK");
        assert_eq!(cpu.regs.gr_l(1), 0x1000); // unchanged
        assert_eq!(cpu.psw.cc, 0);
    }
}
