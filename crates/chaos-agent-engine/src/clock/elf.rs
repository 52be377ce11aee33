//! Just enough ELF64 reading to find an exported symbol in a vDSO image.

use chaos_agent_core::ExperimentError;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const PT_LOAD: u32 = 1;
const SHT_DYNSYM: u32 = 11;
const SYMBOL_LEN: usize = 24;
const JMP_REL32: u8 = 0xe9;
const JMP_REL32_LEN: u64 = 5;
const MAX_THUNK_HOPS: usize = 4;

/// Location of a symbol relative to the start of the mapped image.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct Symbol {
    pub offset: u64,
    pub size: u64,
}

fn malformed(what: &str) -> ExperimentError {
    ExperimentError::Transient(format!("malformed vDSO image: {what}"))
}

fn add(base: u64, delta: u64) -> Result<u64, ExperimentError> {
    base.checked_add(delta).ok_or_else(|| malformed("offset overflow"))
}

/// `base + index * stride`, failing instead of wrapping.
fn element(base: u64, index: u64, stride: u64) -> Result<u64, ExperimentError> {
    index
        .checked_mul(stride)
        .and_then(|delta| base.checked_add(delta))
        .ok_or_else(|| malformed("table offset overflow"))
}

fn field<const N: usize>(image: &[u8], at: u64) -> Result<[u8; N], ExperimentError> {
    let start = usize::try_from(at).map_err(|_| malformed("offset out of range"))?;
    let end = start.checked_add(N).ok_or_else(|| malformed("offset overflow"))?;
    let mut out = [0_u8; N];
    out.copy_from_slice(
        image
            .get(start..end)
            .ok_or_else(|| malformed("read past end of image"))?,
    );
    Ok(out)
}

fn u16_at(image: &[u8], at: u64) -> Result<u16, ExperimentError> {
    field::<2>(image, at).map(u16::from_le_bytes)
}

fn u32_at(image: &[u8], at: u64) -> Result<u32, ExperimentError> {
    field::<4>(image, at).map(u32::from_le_bytes)
}

fn u64_at(image: &[u8], at: u64) -> Result<u64, ExperimentError> {
    field::<8>(image, at).map(u64::from_le_bytes)
}

fn c_str(image: &[u8], at: u64) -> Result<&[u8], ExperimentError> {
    let start = usize::try_from(at).map_err(|_| malformed("string offset out of range"))?;
    let tail = image
        .get(start..)
        .ok_or_else(|| malformed("string past end of image"))?;
    let len = tail
        .iter()
        .position(|byte| *byte == 0)
        .ok_or_else(|| malformed("unterminated string"))?;
    Ok(&tail[..len])
}

struct Section {
    kind: u32,
    offset: u64,
    size: u64,
    link: u32,
    entsize: u64,
}

fn section(image: &[u8], shoff: u64, shentsize: u64, index: u64) -> Result<Section, ExperimentError> {
    let base = element(shoff, index, shentsize)?;
    Ok(Section {
        kind: u32_at(image, add(base, 0x04)?)?,
        offset: u64_at(image, add(base, 0x18)?)?,
        size: u64_at(image, add(base, 0x20)?)?,
        link: u32_at(image, add(base, 0x28)?)?,
        entsize: u64_at(image, add(base, 0x38)?)?,
    })
}

/// `p_vaddr - p_offset` of the first loadable segment.
fn load_bias(image: &[u8]) -> Result<u64, ExperimentError> {
    let phoff = u64_at(image, 0x20)?;
    let phentsize = u64::from(u16_at(image, 0x36)?);
    let phnum = u64::from(u16_at(image, 0x38)?);
    for index in 0..phnum {
        let base = element(phoff, index, phentsize)?;
        if u32_at(image, base)? == PT_LOAD {
            let offset = u64_at(image, add(base, 0x08)?)?;
            let vaddr = u64_at(image, add(base, 0x10)?)?;
            return Ok(vaddr.wrapping_sub(offset));
        }
    }
    Err(malformed("no PT_LOAD segment"))
}

/// Looks up the first defined dynamic symbol matching one of `names`.
pub(crate) fn find_symbol(image: &[u8], names: &[&str]) -> Result<Symbol, ExperimentError> {
    let ident = field::<6>(image, 0)?;
    if ident[..4] != ELF_MAGIC {
        return Err(malformed("bad magic"));
    }
    if ident[4] != ELFCLASS64 || ident[5] != ELFDATA2LSB {
        return Err(malformed("not a little-endian ELF64 image"));
    }

    let bias = load_bias(image)?;
    let shoff = u64_at(image, 0x28)?;
    let shentsize = u64::from(u16_at(image, 0x3a)?);
    let shnum = u64::from(u16_at(image, 0x3c)?);

    for index in 0..shnum {
        let dynsym = section(image, shoff, shentsize, index)?;
        if dynsym.kind != SHT_DYNSYM {
            continue;
        }
        let strtab = section(image, shoff, shentsize, u64::from(dynsym.link))?;
        let entsize = if dynsym.entsize == 0 {
            SYMBOL_LEN as u64
        } else {
            dynsym.entsize
        };
        for slot in 0..dynsym.size / entsize {
            let base = element(dynsym.offset, slot, entsize)?;
            let name_at = u64::from(u32_at(image, base)?);
            let shndx = u16_at(image, add(base, 0x06)?)?;
            let value = u64_at(image, add(base, 0x08)?)?;
            let size = u64_at(image, add(base, 0x10)?)?;
            if shndx == 0 || value == 0 {
                continue;
            }
            let name = c_str(image, add(strtab.offset, name_at)?)?;
            if names.iter().any(|wanted| wanted.as_bytes() == name) {
                return Ok(Symbol {
                    offset: value.wrapping_sub(bias),
                    size,
                });
            }
        }
    }

    Err(ExperimentError::Transient(format!(
        "vDSO does not export any of {names:?}"
    )))
}

/// Offset of the first instruction that can hold `min_len` patched bytes
/// for `symbol`.
///
/// Some kernels export `clock_gettime` as a 5-byte `jmp rel32` thunk into
/// the real implementation; thunks are followed (within the image) and the
/// patch lands on their target.
pub(crate) fn patch_site(
    image: &[u8],
    symbol: Symbol,
    min_len: usize,
) -> Result<u64, ExperimentError> {
    let image_len = image.len() as u64;
    let mut offset = symbol.offset;
    let mut room = symbol.size;
    for _ in 0..MAX_THUNK_HOPS {
        if field::<1>(image, offset)?[0] != JMP_REL32 {
            break;
        }
        let rel = i64::from(i32::from_le_bytes(field::<4>(image, add(offset, 1)?)?));
        let target = add(offset, JMP_REL32_LEN)?
            .checked_add_signed(rel)
            .filter(|target| *target < image_len)
            .ok_or_else(|| malformed("jump target outside the image"))?;
        offset = target;
        room = image_len - target;
    }

    let fits = room >= min_len as u64 && add(offset, min_len as u64)? <= image_len;
    if !fits {
        return Err(ExperimentError::Transient(format!(
            "clock_gettime entry is too small to patch ({room} bytes)"
        )));
    }
    Ok(offset)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn put(image: &mut Vec<u8>, at: usize, bytes: &[u8]) {
        if image.len() < at + bytes.len() {
            image.resize(at + bytes.len(), 0);
        }
        image[at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// Builds a tiny ELF64 image with one PT_LOAD (vaddr 0x1000 at file
    /// offset 0) and a `.dynsym` exporting `symbols` as (name, value, size).
    pub(crate) fn synthetic_image(symbols: &[(&str, u64, u64)]) -> Vec<u8> {
        let phoff = 0x40;
        let strtab_at = 0x100;
        let mut strtab = vec![0_u8];
        let mut name_offsets = Vec::new();
        for (name, _, _) in symbols {
            name_offsets.push(strtab.len());
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
        }
        let dynsym_at = strtab_at + strtab.len().next_multiple_of(8);
        let dynsym_len = (symbols.len() + 1) * SYMBOL_LEN;
        let shoff = dynsym_at + dynsym_len;

        let mut image = vec![0_u8; 0x40];
        put(&mut image, 0, &ELF_MAGIC);
        image[4] = ELFCLASS64;
        image[5] = ELFDATA2LSB;
        put(&mut image, 0x20, &(phoff as u64).to_le_bytes());
        put(&mut image, 0x28, &(shoff as u64).to_le_bytes());
        put(&mut image, 0x36, &56_u16.to_le_bytes());
        put(&mut image, 0x38, &1_u16.to_le_bytes());
        put(&mut image, 0x3a, &64_u16.to_le_bytes());
        put(&mut image, 0x3c, &3_u16.to_le_bytes());

        put(&mut image, phoff, &PT_LOAD.to_le_bytes());
        put(&mut image, phoff + 0x08, &0_u64.to_le_bytes());
        put(&mut image, phoff + 0x10, &0x1000_u64.to_le_bytes());

        put(&mut image, strtab_at, &strtab);
        for (slot, ((_, value, size), name_at)) in symbols.iter().zip(&name_offsets).enumerate() {
            let base = dynsym_at + (slot + 1) * SYMBOL_LEN;
            put(&mut image, base, &(*name_at as u32).to_le_bytes());
            put(&mut image, base + 0x06, &7_u16.to_le_bytes());
            put(&mut image, base + 0x08, &value.to_le_bytes());
            put(&mut image, base + 0x10, &size.to_le_bytes());
        }

        // Section 0 is the null section, 1 is .dynstr, 2 is .dynsym.
        let dynstr = shoff + 64;
        put(&mut image, dynstr + 0x04, &3_u32.to_le_bytes());
        put(&mut image, dynstr + 0x18, &(strtab_at as u64).to_le_bytes());
        put(&mut image, dynstr + 0x20, &(strtab.len() as u64).to_le_bytes());
        let dynsym = shoff + 128;
        put(&mut image, dynsym + 0x04, &SHT_DYNSYM.to_le_bytes());
        put(&mut image, dynsym + 0x18, &(dynsym_at as u64).to_le_bytes());
        put(&mut image, dynsym + 0x20, &(dynsym_len as u64).to_le_bytes());
        put(&mut image, dynsym + 0x28, &1_u32.to_le_bytes());
        put(&mut image, dynsym + 0x38, &(SYMBOL_LEN as u64).to_le_bytes());
        image
    }

    #[test]
    fn finds_symbol_relative_to_load_bias() {
        let image = synthetic_image(&[
            ("__vdso_gettimeofday", 0x1a00, 40),
            ("__vdso_clock_gettime", 0x1b40, 96),
        ]);
        let symbol = match find_symbol(&image, &["clock_gettime", "__vdso_clock_gettime"]) {
            Ok(symbol) => symbol,
            Err(err) => panic!("unexpected error: {err}"),
        };
        assert_eq!(symbol, Symbol { offset: 0xb40, size: 96 });
    }

    #[test]
    fn missing_symbol_and_bad_magic_are_errors() {
        let image = synthetic_image(&[("__vdso_time", 0x1100, 16)]);
        assert!(find_symbol(&image, &["clock_gettime"]).is_err());

        let mut corrupted = image;
        corrupted[0] = 0;
        assert!(find_symbol(&corrupted, &["__vdso_time"]).is_err());
        assert!(find_symbol(&[0x7f, b'E'], &["__vdso_time"]).is_err());
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    fn own_vdso_exports_clock_gettime() {
        use std::fs::File;
        use std::os::unix::fs::FileExt;

        let own = match i32::try_from(std::process::id()) {
            Ok(pid) => pid,
            Err(err) => panic!("pid out of range: {err}"),
        };
        let maps = match super::super::maps::read_maps(own) {
            Ok(maps) => maps,
            Err(err) => panic!("unexpected error: {err}"),
        };
        let Some(vdso) = maps.iter().find(|mapping| mapping.is_vdso()) else {
            return;
        };
        let Ok(mem) = File::open("/proc/self/mem") else {
            return;
        };
        let mut image = vec![0_u8; usize::try_from(vdso.len()).unwrap_or(0)];
        if mem.read_exact_at(&mut image, vdso.start).is_err() {
            return;
        }
        let symbol = match find_symbol(&image, &["clock_gettime", "__vdso_clock_gettime"]) {
            Ok(symbol) => symbol,
            Err(err) => panic!("unexpected error: {err}"),
        };
        assert!(symbol.offset < vdso.len());
        let site = match patch_site(&image, symbol, 12) {
            Ok(site) => site,
            Err(err) => panic!("unexpected error: {err}"),
        };
        assert!(site + 12 <= vdso.len());
    }

    #[test]
    fn thunk_entries_are_followed_to_their_target() {
        let mut image = synthetic_image(&[("__vdso_clock_gettime", 0x1400, 5)]);
        image.resize(0x600, 0x90);
        // 0x400: jmp 0x240 (rel32 = 0x240 - 0x405)
        let rel = 0x240_i32 - 0x405;
        image[0x400] = JMP_REL32;
        image[0x401..0x405].copy_from_slice(&rel.to_le_bytes());

        let symbol = match find_symbol(&image, &["__vdso_clock_gettime"]) {
            Ok(symbol) => symbol,
            Err(err) => panic!("unexpected error: {err}"),
        };
        assert_eq!(symbol, Symbol { offset: 0x400, size: 5 });
        match patch_site(&image, symbol, 12) {
            Ok(site) => assert_eq!(site, 0x240),
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    #[test]
    fn unpatchable_entries_are_rejected() {
        let mut image = synthetic_image(&[("__vdso_clock_gettime", 0x1400, 5)]);
        image.resize(0x600, 0x90);
        // A 5-byte function that is not a thunk.
        assert!(patch_site(&image, Symbol { offset: 0x400, size: 5 }, 12).is_err());

        // A thunk jumping past the end of the image.
        image[0x400] = JMP_REL32;
        image[0x401..0x405].copy_from_slice(&0x7fff_0000_i32.to_le_bytes());
        assert!(patch_site(&image, Symbol { offset: 0x400, size: 5 }, 12).is_err());

        // A thunk landing too close to the end of the image.
        let rel = 0x5fa_i32 - 0x405;
        image[0x401..0x405].copy_from_slice(&rel.to_le_bytes());
        assert!(patch_site(&image, Symbol { offset: 0x400, size: 5 }, 12).is_err());

        // A regular function with room is patched in place.
        image[0x400] = 0x55;
        match patch_site(&image, Symbol { offset: 0x400, size: 64 }, 12) {
            Ok(site) => assert_eq!(site, 0x400),
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    #[test]
    fn oversized_table_offsets_fail_without_overflow() {
        let image = synthetic_image(&[("__vdso_clock_gettime", 0x1400, 64)]);

        let mut huge_shoff = image.clone();
        huge_shoff[0x28..0x30].copy_from_slice(&(u64::MAX - 8).to_le_bytes());
        assert!(find_symbol(&huge_shoff, &["__vdso_clock_gettime"]).is_err());

        let mut huge_phoff = image.clone();
        huge_phoff[0x20..0x28].copy_from_slice(&(u64::MAX - 2).to_le_bytes());
        assert!(find_symbol(&huge_phoff, &["__vdso_clock_gettime"]).is_err());

        // Point .dynsym's sh_offset near u64::MAX.
        let shoff = match u64_at(&image, 0x28) {
            Ok(shoff) => usize::try_from(shoff).unwrap_or(usize::MAX),
            Err(err) => panic!("unexpected error: {err}"),
        };
        let mut huge_dynsym = image;
        let at = shoff + 128 + 0x18;
        huge_dynsym[at..at + 8].copy_from_slice(&(u64::MAX - 16).to_le_bytes());
        assert!(find_symbol(&huge_dynsym, &["__vdso_clock_gettime"]).is_err());
    }
}
