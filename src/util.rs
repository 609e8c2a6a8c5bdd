//! Small helpers shared by the dump pipeline: path sanitising, size
//! formatting, and output file name synthesis.

/// Characters never allowed in emitted path components.
const ILLEGAL_FS_CHARS: &[char] = &[
    '?', '[', ']', '/', '\\', '=', '+', '<', '>', ':', ';', '"', ',', '*', '|', '^',
];

/// How aggressively emitted path components are cleaned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IllegalCharReplaceMode {
    /// Replace only characters the FAT/exFAT family rejects (plus control
    /// bytes). Used when writing to an external host.
    IllegalFsOnly,
    /// Additionally replace every non-ASCII byte. Used for the console's
    /// own SD storage.
    KeepAsciiOnly,
}

/// Replaces illegal characters in a single path component with `_`.
/// Never applied to separators; callers sanitise per component.
pub fn sanitize_path_component(component: &str, mode: IllegalCharReplaceMode) -> String {
    component
        .chars()
        .map(|c| {
            if ILLEGAL_FS_CHARS.contains(&c) || (c as u32) < 0x20 {
                '_'
            } else if mode == IllegalCharReplaceMode::KeepAsciiOnly && (c as u32) >= 0x7F {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Formats a byte count with binary prefixes ("3.50 GiB").
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

/// Relationship of an NSP to its application, encoded in the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NspTitleClass {
    Base,
    Update,
    Dlc,
    DlcUpdate,
}

impl NspTitleClass {
    pub fn suffix(&self) -> &'static str {
        match self {
            NspTitleClass::Base => "BASE",
            NspTitleClass::Update => "UPD",
            NspTitleClass::Dlc => "DLC",
            NspTitleClass::DlcUpdate => "DLCUPD",
        }
    }
}

/// Gamecard image file name:
/// `<name> [v<update_version>] [<title_id>][v<version>][<KA|NKA>][<C|NC>][<T|NT>].xci`
pub fn xci_file_name(
    app_name: &str,
    update_version: Option<u32>,
    title_id: u64,
    version: u32,
    prepend_key_area: bool,
    keep_certificate: bool,
    trim_dump: bool,
    mode: IllegalCharReplaceMode,
) -> String {
    let name = sanitize_path_component(app_name, mode);
    let update = update_version
        .map(|v| format!(" [v{}]", v))
        .unwrap_or_default();
    format!(
        "{}{} [{:016X}][v{}][{}][{}][{}].xci",
        name,
        update,
        title_id,
        version,
        if prepend_key_area { "KA" } else { "NKA" },
        if keep_certificate { "C" } else { "NC" },
        if trim_dump { "T" } else { "NT" },
    )
}

/// NSP file name:
/// `<name> [v<display_version>] [<title_id>][v<version>][<class>].nsp`
pub fn nsp_file_name(
    app_name: &str,
    display_version: Option<&str>,
    title_id: u64,
    version: u32,
    class: NspTitleClass,
    mode: IllegalCharReplaceMode,
) -> String {
    let name = sanitize_path_component(app_name, mode);
    let display = display_version
        .filter(|v| !v.is_empty())
        .map(|v| format!(" [v{}]", sanitize_path_component(v, mode)))
        .unwrap_or_default();
    format!(
        "{}{} [{:016X}][v{}][{}].nsp",
        name,
        display,
        title_id,
        version,
        class.suffix(),
    )
}

/// Raw NCA entry name: `<content_id>.nca` or `<content_id>.cnmt.nca`.
pub fn nca_file_name(content_id: &[u8; 0x10], is_meta: bool) -> String {
    format!(
        "{}{}.nca",
        hex::encode(content_id),
        if is_meta { ".cnmt" } else { "" }
    )
}

/// LayeredFS root for raw or extracted FS sections:
/// `atmosphere/contents/<title_id + id_offset>`.
pub fn layeredfs_content_dir(title_id: u64, id_offset: u8) -> String {
    format!("atmosphere/contents/{:016X}", title_id + id_offset as u64)
}

/// Raw FS-section dump path: `<content_type> #<id_offset>/<section>.nsp`
/// for partition sections, `.bin` for everything else.
pub fn raw_section_file_name(
    content_type: &str,
    id_offset: u8,
    section_idx: usize,
    is_partition_fs: bool,
) -> String {
    format!(
        "{} #{}/{}.{}",
        content_type,
        id_offset,
        section_idx,
        if is_partition_fs { "nsp" } else { "bin" },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_modes() {
        assert_eq!(
            sanitize_path_component("Game: The \"Sequel\"?", IllegalCharReplaceMode::IllegalFsOnly),
            "Game_ The _Sequel__"
        );
        // Non-ASCII survives fs-only mode, dies in keep-ascii mode.
        assert_eq!(
            sanitize_path_component("ゼルダ/Link", IllegalCharReplaceMode::IllegalFsOnly),
            "ゼルダ_Link"
        );
        assert_eq!(
            sanitize_path_component("ゼルダ/Link", IllegalCharReplaceMode::KeepAsciiOnly),
            "____Link"
        );
        // Control bytes always die.
        assert_eq!(
            sanitize_path_component("a\tb", IllegalCharReplaceMode::IllegalFsOnly),
            "a_b"
        );
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(0x400), "1.00 KiB");
        assert_eq!(format_size(8 * 1024 * 1024 * 1024), "8.00 GiB");
        assert_eq!(format_size(0x180000), "1.50 MiB");
    }

    #[test]
    fn test_xci_name_flags() {
        let name = xci_file_name(
            "Sample Game",
            None,
            0x0100C4C320C0FFEE,
            0,
            false,
            true,
            false,
            IllegalCharReplaceMode::IllegalFsOnly,
        );
        assert_eq!(name, "Sample Game [0100C4C320C0FFEE][v0][NKA][C][NT].xci");

        let name = xci_file_name(
            "Sample Game",
            Some(65536),
            0x0100C4C320C0FFEE,
            0,
            true,
            false,
            true,
            IllegalCharReplaceMode::IllegalFsOnly,
        );
        assert_eq!(
            name,
            "Sample Game [v65536] [0100C4C320C0FFEE][v0][KA][NC][T].xci"
        );
    }

    #[test]
    fn test_nsp_name() {
        let name = nsp_file_name(
            "Sample Game",
            Some("1.2.3"),
            0x0100C4C320C0FFEE,
            0x10000,
            NspTitleClass::Update,
            IllegalCharReplaceMode::IllegalFsOnly,
        );
        assert_eq!(
            name,
            "Sample Game [v1.2.3] [0100C4C320C0FFEE][v65536][UPD].nsp"
        );

        let name = nsp_file_name(
            "Sample Game",
            None,
            0x0100C4C320C0FFEE,
            0,
            NspTitleClass::Base,
            IllegalCharReplaceMode::IllegalFsOnly,
        );
        assert_eq!(name, "Sample Game [0100C4C320C0FFEE][v0][BASE].nsp");
    }

    #[test]
    fn test_nca_and_layeredfs_names() {
        let id = [0xAB; 0x10];
        assert_eq!(nca_file_name(&id, false), format!("{}.nca", "ab".repeat(16)));
        assert_eq!(
            nca_file_name(&id, true),
            format!("{}.cnmt.nca", "ab".repeat(16))
        );
        assert_eq!(
            layeredfs_content_dir(0x0100000000001000, 2),
            "atmosphere/contents/0100000000001002"
        );
        assert_eq!(raw_section_file_name("Program", 0, 1, false), "Program #0/1.bin");
        assert_eq!(raw_section_file_name("Program", 2, 0, true), "Program #2/0.nsp");
    }
}
