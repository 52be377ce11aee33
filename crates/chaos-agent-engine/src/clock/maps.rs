use std::fs;

use chaos_agent_core::ExperimentError;

/// One line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct Mapping {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub offset: u64,
    pub inode: u64,
    pub path: String,
}

impl Mapping {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_vdso(&self) -> bool {
        self.path == "[vdso]"
    }

    pub fn is_anonymous_rwx(&self) -> bool {
        self.perms.starts_with("rwx") && self.inode == 0 && self.path.is_empty()
    }
}

fn parse_line(line: &str) -> Option<Mapping> {
    let mut fields = line.split_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let perms = fields.next()?.to_string();
    let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
    let _device = fields.next()?;
    let inode = fields.next()?.parse().ok()?;
    let path = fields.collect::<Vec<_>>().join(" ");

    Some(Mapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        perms,
        offset,
        inode,
        path,
    })
}

pub(crate) fn parse_maps(text: &str) -> Vec<Mapping> {
    text.lines().filter_map(parse_line).collect()
}

pub(crate) fn read_maps(pid: i32) -> Result<Vec<Mapping>, ExperimentError> {
    let text = fs::read_to_string(format!("/proc/{pid}/maps")).map_err(|err| {
        ExperimentError::Transient(format!("failed to read memory map of {pid}: {err}"))
    })?;
    Ok(parse_maps(&text))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
55d0c8a00000-55d0c8a02000 r--p 00000000 fd:01 1835106                    /usr/bin/sleep
7f3a1c000000-7f3a1c001000 rwxp 00000000 00:00 0
7f3a1c400000-7f3a1c428000 r--p 00000000 fd:01 1838392                    /usr/lib/x86_64-linux-gnu/libc.so.6
7ffd5b7ed000-7ffd5b7f1000 r--p 00000000 00:00 0                          [vvar]
7ffd5b7f1000-7ffd5b7f3000 r-xp 00000000 00:00 0                          [vdso]
garbage line
";

    #[test]
    fn parses_vdso_and_anonymous_regions() {
        let maps = parse_maps(SAMPLE);
        assert_eq!(maps.len(), 5);

        let vdso: Vec<_> = maps.iter().filter(|mapping| mapping.is_vdso()).collect();
        assert_eq!(vdso.len(), 1);
        assert_eq!(vdso[0].start, 0x7ffd_5b7f_1000);
        assert_eq!(vdso[0].len(), 0x2000);
        assert_eq!(vdso[0].perms, "r-xp");

        let rwx: Vec<_> = maps.iter().filter(|mapping| mapping.is_anonymous_rwx()).collect();
        assert_eq!(rwx.len(), 1);
        assert_eq!(rwx[0].start, 0x7f3a_1c00_0000);
    }

    #[test]
    fn keeps_paths_with_spaces() {
        let maps = parse_maps("00400000-00401000 r-xp 00001000 08:01 42 /opt/my app/bin (deleted)\n");
        assert_eq!(maps[0].path, "/opt/my app/bin (deleted)");
        assert_eq!(maps[0].offset, 0x1000);
        assert_eq!(maps[0].inode, 42);
    }

    #[test]
    fn own_process_has_a_readable_map() {
        let own = match i32::try_from(std::process::id()) {
            Ok(pid) => pid,
            Err(err) => panic!("pid out of range: {err}"),
        };
        let maps = match read_maps(own) {
            Ok(maps) => maps,
            Err(err) => panic!("unexpected error: {err}"),
        };
        assert!(!maps.is_empty());
    }
}
