// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::io::Write;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use xmltree::Element;

use crate::manifest::attr_unsigned;
use crate::types::{FirehoseError, QdlChan};
use crate::{firehose_apply_ufs_body, firehose_apply_ufs_common, firehose_apply_ufs_epilogue};

/// Device-level provisioning parameters, one per plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UfsCommon {
    pub number_lu: u32,
    pub boot_enable: bool,
    pub descr_access_en: bool,
    pub init_power_mode: u32,
    pub high_priority_lun: u32,
    pub secure_removal_type: u32,
    pub init_active_icc_level: u32,
    pub periodic_rtc_update: u32,
    /// Whether the config descriptor gets locked after provisioning. Must
    /// agree with --finalize-provisioning; see wire_lock_value() for what
    /// actually goes on the wire.
    pub config_descr_lock: bool,
}

/// One logical unit description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UfsBody {
    pub lu_num: u32,
    pub lu_enable: bool,
    pub boot_lun_id: u32,
    pub size_in_kb: u64,
    pub data_reliability: u32,
    pub lu_write_protect: u32,
    pub memory_type: u32,
    pub logical_block_size: u32,
    pub provisioning_type: u32,
    pub context_capabilities: u32,
    pub desc: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UfsEpilogue {
    pub lun_to_grow: u32,
}

/// A complete provisioning plan: one common block, at least one LU, one
/// epilogue. Anything less is rejected at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UfsPlan {
    pub common: UfsCommon,
    pub bodies: Vec<UfsBody>,
    pub epilogue: UfsEpilogue,
}

const NOTICE_BCONFIGDESCRLOCK: &str = "
UFS provisioning is an irreversible (OTP) operation unless bConfigDescrLock = 0.
To prevent unintentional device locking the tool has the following safety:

	if you REALLY intend to perform OTP, ensure that your XML includes
	bConfigDescrLock = 1 AND pass --finalize-provisioning.

	Unless you intend to lock your device, set bConfigDescrLock = 0 in
	your XML and don't pass --finalize-provisioning.

In case of mismatch between command line and XML, provisioning is not performed.
";

fn parse_common(e: &Element) -> Result<UfsCommon> {
    Ok(UfsCommon {
        number_lu: attr_unsigned(e, "bNumberLU")? as u32,
        boot_enable: attr_unsigned(e, "bBootEnable")? != 0,
        descr_access_en: attr_unsigned(e, "bDescrAccessEn")? != 0,
        init_power_mode: attr_unsigned(e, "bInitPowerMode")? as u32,
        high_priority_lun: attr_unsigned(e, "bHighPriorityLUN")? as u32,
        secure_removal_type: attr_unsigned(e, "bSecureRemovalType")? as u32,
        init_active_icc_level: attr_unsigned(e, "bInitActiveICCLevel")? as u32,
        periodic_rtc_update: attr_unsigned(e, "wPeriodicRTCUpdate")? as u32,
        config_descr_lock: attr_unsigned(e, "bConfigDescrLock")? != 0,
    })
}

fn parse_body(e: &Element) -> Result<UfsBody> {
    Ok(UfsBody {
        lu_num: attr_unsigned(e, "LUNum")? as u32,
        lu_enable: attr_unsigned(e, "bLUEnable")? != 0,
        boot_lun_id: attr_unsigned(e, "bBootLunID")? as u32,
        size_in_kb: attr_unsigned(e, "size_in_kb")?,
        data_reliability: attr_unsigned(e, "bDataReliability")? as u32,
        lu_write_protect: attr_unsigned(e, "bLUWriteProtect")? as u32,
        memory_type: attr_unsigned(e, "bMemoryType")? as u32,
        logical_block_size: attr_unsigned(e, "bLogicalBlockSize")? as u32,
        provisioning_type: attr_unsigned(e, "bProvisioningType")? as u32,
        context_capabilities: attr_unsigned(e, "wContextCapabilities")? as u32,
        desc: e.attributes.get("desc").cloned(),
    })
}

fn parse_epilogue(e: &Element) -> Result<UfsEpilogue> {
    Ok(UfsEpilogue {
        lun_to_grow: attr_unsigned(e, "LUNtoGrow")? as u32,
    })
}

/// Build a provisioning plan out of a <data> manifest. The lock flag in the
/// XML has to match the command line before anything touches the wire.
pub fn load(root: &Element, finalize_provisioning: bool) -> Result<UfsPlan> {
    let mut common = None;
    let mut bodies = vec![];
    let mut epilogue = None;

    for node in &root.children {
        let Some(e) = node.as_element() else { continue };
        if e.name != "ufs" {
            eprintln!("[UFS] unrecognized tag \"{}\", ignoring", e.name);
            continue;
        }

        if e.attributes.contains_key("bNumberLU") {
            if common.is_some() {
                bail!("only one common tag is allowed");
            }
            common = Some(parse_common(e).context("common tag corrupted")?);
        } else if e.attributes.contains_key("LUNum") {
            bodies.push(parse_body(e).context("LU tag corrupted")?);
        } else if e.attributes.contains_key("commit") {
            if epilogue.is_some() {
                bail!("only one finalizing tag is allowed");
            }
            epilogue = Some(parse_epilogue(e).context("finalizing tag corrupted")?);
        } else {
            bail!("unknown <ufs> tag variant");
        }
    }

    let (Some(common), Some(epilogue)) = (common, epilogue) else {
        bail!("provisioning XML is incomplete");
    };
    if bodies.is_empty() {
        bail!("provisioning XML is incomplete");
    }

    if common.config_descr_lock != finalize_provisioning {
        eprintln!(
            "[UFS] bConfigDescrLock = {} doesn't match --finalize-provisioning = {}",
            common.config_descr_lock as u8, finalize_provisioning
        );
        eprintln!("{NOTICE_BCONFIGDESCRLOCK}");
        bail!("bConfigDescrLock doesn't match --finalize-provisioning");
    }

    Ok(UfsPlan {
        common,
        bodies,
        epilogue,
    })
}

fn apply_plan<T: QdlChan>(
    channel: &mut T,
    plan: &UfsPlan,
    commit: bool,
) -> Result<(), FirehoseError> {
    firehose_apply_ufs_common(channel, &plan.common)?;
    for body in &plan.bodies {
        firehose_apply_ufs_body(channel, body)?;
    }
    firehose_apply_ufs_epilogue(channel, &plan.epilogue, commit)
}

fn otp_countdown() {
    println!("Attention!");
    println!("Irreversible provisioning will start in 5 s");
    for _ in 0..5 {
        print!(".\x07");
        std::io::stdout().flush().ok();
        thread::sleep(Duration::from_secs(1));
    }
    println!();
}

/// Run the plan twice: a commit=0 pass that only has the target validate
/// the descriptors, then the committing pass once the target accepted it.
pub fn provisioning_execute<T: QdlChan>(
    channel: &mut T,
    plan: &UfsPlan,
) -> Result<(), FirehoseError> {
    if let Err(e) = apply_plan(channel, plan, false) {
        eprintln!("[UFS] provisioning impossible, provisioning XML may be corrupted");
        return Err(e);
    }

    if plan.common.config_descr_lock {
        otp_countdown();
    }

    apply_plan(channel, plan, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ack_response, MockChannel};

    const PROVISION: &str = r#"<?xml version="1.0" ?>
<data>
  <ufs bNumberLU="2" bBootEnable="1" bDescrAccessEn="0" bInitPowerMode="1"
       bHighPriorityLUN="0" bSecureRemovalType="0" bInitActiveICCLevel="0"
       wPeriodicRTCUpdate="0" bConfigDescrLock="0"/>
  <ufs LUNum="0" bLUEnable="1" bBootLunID="1" size_in_kb="8192"
       bDataReliability="0" bLUWriteProtect="0" bMemoryType="0"
       bLogicalBlockSize="12" bProvisioningType="3" wContextCapabilities="0"
       desc="xbl_a"/>
  <ufs LUNum="1" bLUEnable="1" bBootLunID="0" size_in_kb="0"
       bDataReliability="0" bLUWriteProtect="0" bMemoryType="0"
       bLogicalBlockSize="12" bProvisioningType="3" wContextCapabilities="0"/>
  <ufs LUNtoGrow="1" commit="1"/>
</data>"#;

    fn parse(xml: &str) -> Element {
        Element::parse(xml.as_bytes()).unwrap()
    }

    #[test]
    fn complete_plan_loads() {
        let plan = load(&parse(PROVISION), false).unwrap();

        assert_eq!(plan.common.number_lu, 2);
        assert!(plan.common.boot_enable);
        assert!(!plan.common.config_descr_lock);
        assert_eq!(plan.bodies.len(), 2);
        assert_eq!(plan.bodies[0].desc.as_deref(), Some("xbl_a"));
        assert_eq!(plan.bodies[1].desc, None);
        assert_eq!(plan.epilogue.lun_to_grow, 1);
    }

    #[test]
    fn lock_flag_must_match_the_command_line() {
        assert!(load(&parse(PROVISION), true).is_err());

        let locked = PROVISION.replace("bConfigDescrLock=\"0\"", "bConfigDescrLock=\"1\"");
        assert!(load(&parse(&locked), false).is_err());
        assert!(load(&parse(&locked), true).is_ok());
    }

    #[test]
    fn incomplete_plans_are_rejected() {
        let no_epilogue = PROVISION.replace(r#"<ufs LUNtoGrow="1" commit="1"/>"#, "");
        assert!(load(&parse(&no_epilogue), false).is_err());

        let twice = PROVISION.replace(
            r#"<ufs LUNtoGrow="1" commit="1"/>"#,
            r#"<ufs LUNtoGrow="1" commit="1"/><ufs LUNtoGrow="0" commit="1"/>"#,
        );
        assert!(load(&parse(&twice), false).is_err());
    }

    #[test]
    fn provisioning_runs_a_dry_pass_before_committing() {
        let plan = load(&parse(PROVISION), false).unwrap();

        let mut channel = MockChannel::new();
        // (common + 2 LUs + epilogue) x 2 passes
        for _ in 0..8 {
            channel.push_read(ack_response());
            channel.push_timeout();
        }

        provisioning_execute(&mut channel, &plan).unwrap();
        assert_eq!(channel.writes.len(), 8);

        let dry = String::from_utf8(channel.writes[3].0.clone()).unwrap();
        assert!(dry.contains("LUNtoGrow=\"1\""));
        assert!(dry.contains("commit=\"0\""));

        let committing = String::from_utf8(channel.writes[7].0.clone()).unwrap();
        assert!(committing.contains("commit=\"1\""));
    }

    #[test]
    fn dry_pass_nak_stops_provisioning() {
        let plan = load(&parse(PROVISION), false).unwrap();

        let mut channel = MockChannel::new();
        channel.push_read(crate::testutil::nak_response());

        assert!(provisioning_execute(&mut channel, &plan).is_err());
        // nothing past the refused common tag
        assert_eq!(channel.writes.len(), 1);
    }
}
