//! Direct access to host memory on behalf of simulated code.
//!
//! Simulated threads run concurrently against the same host memory, so
//! aligned accesses go through atomics. Locked read-modify-write
//! instructions require natural alignment.

use std::ptr;
use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering};

use crate::SimError;

/// Fake addresses for host functions start here; nothing below the first
/// page or inside this range is real memory.
pub const HOST_BASE: u64 = 0xffff_f000_0000_0000;
const LOW_LIMIT: u64 = 0x1000;

pub(crate) fn mask(size: usize) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

pub(crate) fn sign_extend(value: u64, size: usize) -> u64 {
    match size {
        1 => value as u8 as i8 as i64 as u64,
        2 => value as u16 as i16 as i64 as u64,
        4 => value as u32 as i32 as i64 as u64,
        _ => value,
    }
}

fn check(addr: u64, size: usize) -> Result<(), SimError> {
    let end = addr.checked_add(size as u64);

    if addr < LOW_LIMIT || end.is_none_or(|end| end > HOST_BASE) {
        return Err(SimError::InvalidAccess(addr));
    }

    Ok(())
}

fn check_aligned(addr: u64, size: usize) -> Result<(), SimError> {
    check(addr, size)?;

    if addr % size as u64 != 0 {
        return Err(SimError::Misaligned { addr, align: size });
    }

    Ok(())
}

pub fn load(addr: u64, size: usize) -> Result<u64, SimError> {
    check(addr, size)?;

    let value = unsafe {
        if addr % size as u64 == 0 {
            match size {
                1 => AtomicU8::from_ptr(addr as *mut u8).load(Ordering::Relaxed) as u64,
                2 => AtomicU16::from_ptr(addr as *mut u16).load(Ordering::Relaxed) as u64,
                4 => AtomicU32::from_ptr(addr as *mut u32).load(Ordering::Relaxed) as u64,
                8 => AtomicU64::from_ptr(addr as *mut u64).load(Ordering::Relaxed),
                _ => unreachable!(),
            }
        } else {
            match size {
                2 => ptr::read_unaligned(addr as *const u16) as u64,
                4 => ptr::read_unaligned(addr as *const u32) as u64,
                8 => ptr::read_unaligned(addr as *const u64),
                _ => unreachable!(),
            }
        }
    };

    Ok(value)
}

pub fn store(addr: u64, size: usize, value: u64) -> Result<(), SimError> {
    check(addr, size)?;

    unsafe {
        if addr % size as u64 == 0 {
            match size {
                1 => AtomicU8::from_ptr(addr as *mut u8).store(value as u8, Ordering::Relaxed),
                2 => AtomicU16::from_ptr(addr as *mut u16).store(value as u16, Ordering::Relaxed),
                4 => AtomicU32::from_ptr(addr as *mut u32).store(value as u32, Ordering::Relaxed),
                8 => AtomicU64::from_ptr(addr as *mut u64).store(value, Ordering::Relaxed),
                _ => unreachable!(),
            }
        } else {
            match size {
                2 => ptr::write_unaligned(addr as *mut u16, value as u16),
                4 => ptr::write_unaligned(addr as *mut u32, value as u32),
                8 => ptr::write_unaligned(addr as *mut u64, value),
                _ => unreachable!(),
            }
        }
    }

    Ok(())
}

pub fn load128(addr: u64) -> Result<u128, SimError> {
    let lo = load(addr, 8)?;
    let hi = load(addr + 8, 8)?;
    Ok((hi as u128) << 64 | lo as u128)
}

pub fn store128(addr: u64, value: u128) -> Result<(), SimError> {
    store(addr, 8, value as u64)?;
    store(addr + 8, 8, (value >> 64) as u64)
}

/// Locked compare-and-exchange; returns `Ok(old)` on success and
/// `Err(current)` when the comparison failed.
pub fn compare_exchange(
    addr: u64,
    size: usize,
    expected: u64,
    new: u64,
) -> Result<Result<u64, u64>, SimError> {
    check_aligned(addr, size)?;

    let result = unsafe {
        match size {
            4 => AtomicU32::from_ptr(addr as *mut u32)
                .compare_exchange(
                    expected as u32,
                    new as u32,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .map(|v| v as u64)
                .map_err(|v| v as u64),
            8 => AtomicU64::from_ptr(addr as *mut u64).compare_exchange(
                expected,
                new,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ),
            _ => return Err(SimError::Misaligned { addr, align: 4 }),
        }
    };

    Ok(result)
}

pub fn swap(addr: u64, size: usize, new: u64) -> Result<u64, SimError> {
    check_aligned(addr, size)?;

    let old = unsafe {
        match size {
            4 => AtomicU32::from_ptr(addr as *mut u32).swap(new as u32, Ordering::SeqCst) as u64,
            8 => AtomicU64::from_ptr(addr as *mut u64).swap(new, Ordering::SeqCst),
            _ => return Err(SimError::Misaligned { addr, align: 4 }),
        }
    };

    Ok(old)
}

pub fn fetch_add(addr: u64, size: usize, delta: u64) -> Result<u64, SimError> {
    check_aligned(addr, size)?;

    let old = unsafe {
        match size {
            4 => {
                AtomicU32::from_ptr(addr as *mut u32).fetch_add(delta as u32, Ordering::SeqCst)
                    as u64
            }
            8 => AtomicU64::from_ptr(addr as *mut u64).fetch_add(delta, Ordering::SeqCst),
            _ => return Err(SimError::Misaligned { addr, align: 4 }),
        }
    };

    Ok(old)
}
