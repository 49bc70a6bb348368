// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use xmltree::Element;

use crate::ufs::{self, UfsPlan};

/// What a manifest file contains, detected from its root element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Patch,
    Program,
    Ufs,
    Contents,
    Unknown,
}

/// One <program> entry out of a rawprogram manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub sector_size: usize,
    /// Where in the source file to start reading, in sectors.
    pub file_offset: u64,
    /// Empty filename means there's no payload to send for this entry.
    pub filename: String,
    pub label: String,
    /// Declared partition length; 0 means derive it from the file size,
    /// anything else is an upper bound.
    pub num_sectors: usize,
    pub partition: u32,
    /// Kept as the literal attribute text; the target resolves symbolic
    /// expressions like NUM_DISK_SECTORS-34 itself.
    pub start_sector: String,
}

/// One <patch> entry. Only entries aimed at "DISK" are ever sent; the rest
/// describe firmware-internal patches the target applies on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub sector_size: usize,
    pub byte_offset: u64,
    pub filename: String,
    pub partition: u32,
    pub size_in_bytes: u64,
    pub start_sector: String,
    pub value: String,
    pub what: String,
}

/// Everything the CLI loaded for this run, in source order. Populated once
/// during argument handling and read-only afterwards.
#[derive(Debug, Default)]
pub struct PlanContext {
    pub programs: Vec<Program>,
    pub patches: Vec<Patch>,
    pub ufs: Option<UfsPlan>,
}

impl PlanContext {
    /// Load one manifest file, appending to the plan. The file kind is
    /// auto-detected from the root element.
    pub fn load_file(&mut self, path: &Path, finalize_provisioning: bool) -> Result<()> {
        let raw = fs::read(path).with_context(|| format!("couldn't read {}", path.display()))?;
        let xml = Element::parse(&raw[..])
            .with_context(|| format!("failed to parse {}", path.display()))?;

        match detect_kind(&xml) {
            ManifestKind::Program => {
                let programs = load_programs(&xml)
                    .with_context(|| format!("[PROGRAM] errors while parsing {}", path.display()))?;
                self.programs.extend(programs);
            }
            ManifestKind::Patch => {
                let patches = load_patches(&xml)
                    .with_context(|| format!("[PATCH] errors while parsing {}", path.display()))?;
                self.patches.extend(patches);
            }
            ManifestKind::Ufs => {
                if self.ufs.is_some() {
                    bail!(
                        "Only one UFS provisioning XML allowed, {} rejected",
                        path.display()
                    );
                }
                let plan = ufs::load(&xml, finalize_provisioning)
                    .with_context(|| format!("[UFS] errors while parsing {}", path.display()))?;
                self.ufs = Some(plan);
            }
            ManifestKind::Contents => bail!("{}: contents files aren't supported", path.display()),
            ManifestKind::Unknown => bail!("failed to detect file type of {}", path.display()),
        }

        Ok(())
    }

    pub fn need_provisioning(&self) -> bool {
        self.ufs.is_some()
    }
}

pub fn detect_kind(root: &Element) -> ManifestKind {
    match root.name.as_str() {
        "patches" => ManifestKind::Patch,
        "contents" => ManifestKind::Contents,
        "data" => {
            for node in &root.children {
                let Some(e) = node.as_element() else { continue };
                match e.name.as_str() {
                    "program" => return ManifestKind::Program,
                    "ufs" => return ManifestKind::Ufs,
                    _ => continue,
                }
            }
            ManifestKind::Unknown
        }
        _ => ManifestKind::Unknown,
    }
}

pub(crate) fn attr_string(e: &Element, attr: &str) -> Result<String> {
    e.attributes
        .get(attr)
        .cloned()
        .with_context(|| format!("<{}> is missing the \"{attr}\" attribute", e.name))
}

pub(crate) fn attr_unsigned(e: &Element, attr: &str) -> Result<u64> {
    let raw = attr_string(e, attr)?;
    raw.trim()
        .parse()
        .with_context(|| format!("<{}> attribute {attr}=\"{raw}\" is not a number", e.name))
}

fn parse_program(e: &Element) -> Result<Program> {
    let sector_size = attr_unsigned(e, "SECTOR_SIZE_IN_BYTES")? as usize;
    if sector_size == 0 {
        bail!("SECTOR_SIZE_IN_BYTES must be non-zero");
    }

    Ok(Program {
        sector_size,
        // Emitted by every known manifest generator but not always; the
        // target never sees it either way.
        file_offset: match e.attributes.get("file_sector_offset") {
            Some(_) => attr_unsigned(e, "file_sector_offset")?,
            None => 0,
        },
        filename: attr_string(e, "filename")?,
        label: attr_string(e, "label")?,
        num_sectors: attr_unsigned(e, "num_partition_sectors")? as usize,
        partition: attr_unsigned(e, "physical_partition_number")? as u32,
        start_sector: attr_string(e, "start_sector")?,
    })
}

fn parse_patch(e: &Element) -> Result<Patch> {
    Ok(Patch {
        sector_size: attr_unsigned(e, "SECTOR_SIZE_IN_BYTES")? as usize,
        byte_offset: attr_unsigned(e, "byte_offset")?,
        filename: attr_string(e, "filename")?,
        partition: attr_unsigned(e, "physical_partition_number")? as u32,
        size_in_bytes: attr_unsigned(e, "size_in_bytes")?,
        start_sector: attr_string(e, "start_sector")?,
        value: attr_string(e, "value")?,
        what: attr_string(e, "what")?,
    })
}

pub fn load_programs(root: &Element) -> Result<Vec<Program>> {
    let mut programs = vec![];

    for node in &root.children {
        let Some(e) = node.as_element() else { continue };
        if e.name != "program" {
            eprintln!("[PROGRAM] unrecognized tag \"{}\", ignoring", e.name);
            continue;
        }
        programs.push(parse_program(e)?);
    }

    Ok(programs)
}

pub fn load_patches(root: &Element) -> Result<Vec<Patch>> {
    let mut patches = vec![];

    for node in &root.children {
        let Some(e) = node.as_element() else { continue };
        if e.name != "patch" {
            eprintln!("[PATCH] unrecognized tag \"{}\", ignoring", e.name);
            continue;
        }
        patches.push(parse_patch(e)?);
    }

    Ok(patches)
}

const BOOTABLE_PART_NAMES: [&str; 3] = ["xbl", "xbl_a", "sbl1"];

/// Scan program entries for the partition holding the boot image.
///
/// Returns the partition number of the single entry labelled "xbl", "xbl_a"
/// or "sbl1", None when no entry matches, and an error when several do,
/// since in that case the selection logic has to be considered broken.
pub fn find_bootable_partition(programs: &[Program]) -> Result<Option<u32>> {
    let mut bootable = None;

    for program in programs {
        if !BOOTABLE_PART_NAMES.contains(&program.label.as_str()) {
            continue;
        }
        if bootable.is_some() {
            bail!("more than one bootable partition candidate in the manifests");
        }
        bootable = Some(program.partition);
    }

    Ok(bootable)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAWPROGRAM: &str = r#"<?xml version="1.0" ?>
<data>
  <program SECTOR_SIZE_IN_BYTES="4096" file_sector_offset="0" filename="xbl.elf"
           label="xbl" num_partition_sectors="896" physical_partition_number="1"
           start_sector="6"/>
  <program SECTOR_SIZE_IN_BYTES="4096" file_sector_offset="0" filename=""
           label="userdata" num_partition_sectors="0" physical_partition_number="0"
           start_sector="NUM_DISK_SECTORS-33."/>
</data>"#;

    const PATCHES: &str = r#"<?xml version="1.0" ?>
<patches>
  <patch SECTOR_SIZE_IN_BYTES="4096" byte_offset="16" filename="DISK"
         physical_partition_number="0" size_in_bytes="8" start_sector="NUM_DISK_SECTORS-1."
         value="NUM_DISK_SECTORS-6." what="Update Backup Header with LastLBA."/>
  <patch SECTOR_SIZE_IN_BYTES="4096" byte_offset="16" filename="gpt_main0.bin"
         physical_partition_number="0" size_in_bytes="8" start_sector="1"
         value="NUM_DISK_SECTORS-6." what="Update Primary Header with LastLBA."/>
</patches>"#;

    fn parse(xml: &str) -> Element {
        Element::parse(xml.as_bytes()).unwrap()
    }

    #[test]
    fn program_manifest_is_detected_and_loaded_in_order() {
        let root = parse(RAWPROGRAM);
        assert_eq!(detect_kind(&root), ManifestKind::Program);

        let programs = load_programs(&root).unwrap();
        assert_eq!(programs.len(), 2);
        assert_eq!(
            programs[0],
            Program {
                sector_size: 4096,
                file_offset: 0,
                filename: "xbl.elf".into(),
                label: "xbl".into(),
                num_sectors: 896,
                partition: 1,
                start_sector: "6".into(),
            }
        );
        // symbolic start sectors survive verbatim
        assert_eq!(programs[1].start_sector, "NUM_DISK_SECTORS-33.");
        assert!(programs[1].filename.is_empty());
    }

    #[test]
    fn patch_manifest_keeps_non_disk_entries() {
        let root = parse(PATCHES);
        assert_eq!(detect_kind(&root), ManifestKind::Patch);

        let patches = load_patches(&root).unwrap();
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0].filename, "DISK");
        assert_eq!(patches[1].filename, "gpt_main0.bin");
        assert_eq!(patches[0].what, "Update Backup Header with LastLBA.");
    }

    #[test]
    fn missing_required_attribute_fails_the_load() {
        let root = parse(
            r#"<data><program SECTOR_SIZE_IN_BYTES="512" filename="a.bin"
                 num_partition_sectors="1" physical_partition_number="0"
                 start_sector="0"/></data>"#,
        );
        assert!(load_programs(&root).is_err());
    }

    #[test]
    fn zero_sector_size_fails_the_load() {
        let root = parse(
            r#"<data><program SECTOR_SIZE_IN_BYTES="0" filename="a.bin" label="a"
                 num_partition_sectors="1" physical_partition_number="0"
                 start_sector="0"/></data>"#,
        );
        assert!(load_programs(&root).is_err());
    }

    #[test]
    fn detect_other_kinds() {
        assert_eq!(detect_kind(&parse("<contents/>")), ManifestKind::Contents);
        assert_eq!(
            detect_kind(&parse(r#"<data><ufs LUNtoGrow="0" commit="1"/></data>"#)),
            ManifestKind::Ufs
        );
        assert_eq!(detect_kind(&parse("<data/>")), ManifestKind::Unknown);
        assert_eq!(detect_kind(&parse("<bogus/>")), ManifestKind::Unknown);
    }

    fn named(label: &str, partition: u32) -> Program {
        Program {
            sector_size: 4096,
            file_offset: 0,
            filename: String::new(),
            label: label.into(),
            num_sectors: 0,
            partition,
            start_sector: "0".into(),
        }
    }

    #[test]
    fn at_most_one_ufs_plan_per_run() {
        let ufs_xml = r#"<?xml version="1.0" ?>
<data>
  <ufs bNumberLU="1" bBootEnable="1" bDescrAccessEn="0" bInitPowerMode="1"
       bHighPriorityLUN="0" bSecureRemovalType="0" bInitActiveICCLevel="0"
       wPeriodicRTCUpdate="0" bConfigDescrLock="0"/>
  <ufs LUNum="0" bLUEnable="1" bBootLunID="1" size_in_kb="8192"
       bDataReliability="0" bLUWriteProtect="0" bMemoryType="0"
       bLogicalBlockSize="12" bProvisioningType="3" wContextCapabilities="0"/>
  <ufs LUNtoGrow="0" commit="1"/>
</data>"#;
        let path = std::env::temp_dir().join("qdl-test-provision.xml");
        fs::write(&path, ufs_xml).unwrap();

        let mut ctx = PlanContext::default();
        assert!(!ctx.need_provisioning());

        ctx.load_file(&path, false).unwrap();
        assert!(ctx.need_provisioning());

        let err = ctx.load_file(&path, false).unwrap_err();
        assert!(err.to_string().contains("Only one UFS provisioning XML"));

        fs::remove_file(&path).ok();
    }

    #[test]
    fn bootable_partition_selection() {
        let programs = [named("modem", 0), named("xbl", 1), named("userdata", 0)];
        assert_eq!(find_bootable_partition(&programs).unwrap(), Some(1));

        let no_boot = [named("modem", 0)];
        assert_eq!(find_bootable_partition(&no_boot).unwrap(), None);

        let ambiguous = [named("xbl", 1), named("sbl1", 2)];
        assert!(find_bootable_partition(&ambiguous).is_err());
    }
}
