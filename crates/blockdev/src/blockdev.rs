//! Block device and partition inspection.
//!
//! Everything here shells out to util-linux (`lsblk`, `sfdisk`) or reads
//! sysfs; no state is mutated. Partitioning itself lives with the caller.

use std::collections::HashMap;
use std::process::Command;
use std::sync::OnceLock;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use regex::Regex;
use serde::Deserialize;

use ferrite_utils::CommandRunExt;

#[derive(Debug, Deserialize)]
struct DevicesOutput {
    blockdevices: Vec<Device>,
}

/// A block device as reported by `lsblk`.
#[derive(Debug, Deserialize)]
pub struct Device {
    pub name: String,
    pub serial: Option<String>,
    pub model: Option<String>,
    pub size: u64,
    pub children: Option<Vec<Device>>,

    // NOTE not available on older util-linux, so we derive it
    // from `name` when absent.
    pub path: Option<String>,
}

impl Device {
    // Older lsblk doesn't emit PATH, so derive it
    pub fn path(&self) -> String {
        self.path.clone().unwrap_or(format!("/dev/{}", &self.name))
    }

    pub fn has_children(&self) -> bool {
        self.children.as_ref().is_some_and(|v| !v.is_empty())
    }
}

#[context("Listing device {dev}")]
pub fn list_dev(dev: &Utf8Path) -> Result<Device> {
    let mut devs: DevicesOutput = Command::new("lsblk")
        .args(["-J", "-b", "-O"])
        .arg(dev)
        .log_debug()
        .run_and_parse_json()?;
    let result = devs
        .blockdevices
        .drain(..)
        .next()
        .ok_or_else(|| anyhow!("no device output from lsblk for {dev}"));
    result
}

#[derive(Debug, Deserialize)]
struct SfDiskOutput {
    partitiontable: PartitionTable,
}

#[derive(Debug, Deserialize)]
pub struct Partition {
    pub node: String,
    pub start: u64,
    pub size: u64,
    #[serde(rename = "type")]
    pub parttype: String,
    pub uuid: Option<String>,
    pub name: Option<String>,
}

impl Partition {
    pub fn path(&self) -> &Utf8Path {
        self.node.as_str().into()
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PartitionType {
    Dos,
    Gpt,
    Unknown(String),
}

#[derive(Debug, Deserialize)]
pub struct PartitionTable {
    pub label: PartitionType,
    pub id: String,
    pub device: String,
    pub partitions: Vec<Partition>,
}

impl PartitionTable {
    /// Find the partition with the given device name
    pub fn find<'a>(&'a self, devname: &str) -> Option<&'a Partition> {
        self.partitions.iter().find(|p| p.node.as_str() == devname)
    }

    pub fn path(&self) -> &Utf8Path {
        self.device.as_str().into()
    }

    // Find the partition with the given offset (starting at 1)
    pub fn find_partno(&self, partno: u32) -> Result<&Partition> {
        let r = self
            .partitions
            .get(partno.checked_sub(1).expect("1 based partition offset") as usize)
            .ok_or_else(|| anyhow::anyhow!("Missing partition for index {partno}"))?;
        Ok(r)
    }
}

#[context("Listing partitions of {dev}")]
pub fn partitions_of(dev: &Utf8Path) -> Result<PartitionTable> {
    let o: SfDiskOutput = Command::new("sfdisk")
        .args(["-J", dev.as_str()])
        .run_and_parse_json()?;
    Ok(o.partitiontable)
}

/// Compute the device node for partition `partno` of `disk`, following the
/// kernel naming convention: disks whose name ends in a digit (nvme0n1,
/// mmcblk0, loop0) get a `p` separator before the partition number.
pub fn partition_device(disk: &Utf8Path, partno: u32) -> Utf8PathBuf {
    let needs_infix = disk
        .as_str()
        .chars()
        .next_back()
        .is_some_and(|c| c.is_ascii_digit());
    if needs_infix {
        Utf8PathBuf::from(format!("{disk}p{partno}"))
    } else {
        Utf8PathBuf::from(format!("{disk}{partno}"))
    }
}

/// Parse key-value pairs from `lsblk --pairs` output.
fn split_lsblk_line(line: &str) -> HashMap<String, String> {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = REGEX.get_or_init(|| Regex::new(r#"([A-Z-_]+)="([^"]+)""#).unwrap());
    let mut fields: HashMap<String, String> = HashMap::new();
    for cap in regex.captures_iter(line) {
        fields.insert(cap[1].to_string(), cap[2].to_string());
    }
    fields
}

/// Return every block device in the parent hierarchy of `device` capable
/// of containing partitions: "disk" and "mpath" qualify, "part" doesn't.
pub fn find_parent_devices(device: &str) -> Result<Vec<String>> {
    let output = Command::new("lsblk")
        .arg("--pairs")
        .arg("--paths")
        .arg("--inverse")
        .arg("--output")
        .arg("NAME,TYPE")
        .arg(device)
        .run_get_string()?;
    let mut parents = Vec::new();
    // skip first line, which is the device itself
    for line in output.lines().skip(1) {
        let dev = split_lsblk_line(line);
        let name = dev
            .get("NAME")
            .with_context(|| format!("device in hierarchy of {device} missing NAME"))?;
        let kind = dev
            .get("TYPE")
            .with_context(|| format!("device in hierarchy of {device} missing TYPE"))?;
        if kind == "disk" || kind == "loop" {
            parents.push(name.clone());
        } else if kind == "mpath" {
            parents.push(name.clone());
            // we don't need to know what disks back the multipath
            break;
        }
    }
    Ok(parents)
}

/// Kernel name of a device node, e.g. `/dev/dm-0` -> `dm-0`. Symlinks such
/// as `/dev/mapper/root` are resolved first.
#[context("Resolving kernel name of {dev}")]
pub fn kernel_name(dev: &Utf8Path) -> Result<String> {
    let resolved = dev
        .canonicalize_utf8()
        .with_context(|| format!("canonicalizing {dev}"))?;
    let name = resolved
        .file_name()
        .ok_or_else(|| anyhow!("{resolved} has no final component"))?;
    Ok(name.to_owned())
}

/// The physical block devices backing `name`, found by recursively walking
/// `/sys/class/block/<name>/slaves`. A device-mapper node such as a
/// dm-verity root lists its data and hash devices there; a plain partition
/// has no slaves directory and resolves to itself.
pub fn backing_devices(name: &str) -> Result<Vec<String>> {
    backing_devices_in(Utf8Path::new("/sys"), name)
}

fn backing_devices_in(sysfs: &Utf8Path, name: &str) -> Result<Vec<String>> {
    let slaves_dir = sysfs.join(format!("class/block/{name}/slaves"));
    if !slaves_dir.try_exists()? {
        return Ok(vec![name.to_owned()]);
    }
    let mut r = Vec::new();
    for entry in slaves_dir
        .read_dir_utf8()
        .with_context(|| format!("reading {slaves_dir}"))?
    {
        let entry = entry?;
        // A slave may itself be a mapper device (e.g. verity over crypt)
        r.extend(backing_devices_in(sysfs, entry.file_name())?);
    }
    if r.is_empty() {
        // An empty slaves directory still means "not backed by anything else"
        r.push(name.to_owned());
    }
    r.sort();
    r.dedup();
    tracing::debug!("{name} is backed by {r:?}");
    Ok(r)
}

/// Read the 1-based partition index of a partition device from sysfs.
pub fn partition_index(name: &str) -> Result<u32> {
    partition_index_in(Utf8Path::new("/sys"), name)
}

#[context("Reading partition index of {name}")]
fn partition_index_in(sysfs: &Utf8Path, name: &str) -> Result<u32> {
    let p = sysfs.join(format!("class/block/{name}/partition"));
    let buf = std::fs::read_to_string(&p).with_context(|| format!("reading {p}"))?;
    buf.trim().parse().context("parsing sysfs partition index")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_lsblk() {
        let fixture = include_str!("../tests/fixtures/lsblk.json");
        let devs: DevicesOutput = serde_json::from_str(fixture).unwrap();
        let dev = devs.blockdevices.into_iter().next().unwrap();
        assert_eq!(dev.name, "sda");
        assert_eq!(dev.path(), "/dev/sda");
        assert!(dev.has_children());
        let children = dev.children.as_deref().unwrap();
        assert_eq!(children.len(), 6);
        assert_eq!(children[1].name, "sda2");
        assert_eq!(children[1].path(), "/dev/sda2");
    }

    #[test]
    fn test_parse_sfdisk() -> Result<()> {
        let fixture = indoc::indoc! { r#"
        {
            "partitiontable": {
               "label": "gpt",
               "id": "A67AA901-2C72-4818-B098-7F1CAC127279",
               "device": "/dev/vda",
               "unit": "sectors",
               "firstlba": 34,
               "lastlba": 20971486,
               "sectorsize": 512,
               "partitions": [
                  {
                     "node": "/dev/vda1",
                     "start": 2048,
                     "size": 1048576,
                     "type": "C12A7328-F81F-11D2-BA4B-00A0C93EC93B",
                     "uuid": "58A4C5F0-BD12-424C-B563-195AC65A25DD",
                     "name": "esp"
                  },{
                     "node": "/dev/vda2",
                     "start": 1050624,
                     "size": 8388608,
                     "type": "4F68BCE3-E8CD-4DB1-96E7-FBCAF984B709",
                     "uuid": "F51ABB0D-DA16-4A21-83CB-37F4C805AAA0",
                     "name": "root-a"
                  }
               ]
            }
         }
        "# };
        let table: SfDiskOutput = serde_json::from_str(fixture).unwrap();
        let table = table.partitiontable;
        assert_eq!(table.label, PartitionType::Gpt);
        assert_eq!(table.find("/dev/vda2").unwrap().size, 8388608);
        assert_eq!(table.find_partno(1)?.name.as_deref(), Some("esp"));
        assert!(table.find_partno(3).is_err());
        Ok(())
    }

    #[test]
    fn test_partition_device() {
        let cases = [
            ("/dev/sda", 2, "/dev/sda2"),
            ("/dev/vdb", 4, "/dev/vdb4"),
            ("/dev/nvme0n1", 4, "/dev/nvme0n1p4"),
            ("/dev/mmcblk0", 2, "/dev/mmcblk0p2"),
            ("/dev/loop3", 1, "/dev/loop3p1"),
        ];
        for (disk, partno, expected) in cases {
            assert_eq!(
                partition_device(Utf8Path::new(disk), partno).as_str(),
                expected,
                "naming {disk} partition {partno}"
            );
        }
    }

    #[test]
    fn test_split_lsblk_line() {
        let line = r#"NAME="/dev/sda" TYPE="disk""#;
        let fields = split_lsblk_line(line);
        assert_eq!(fields.get("NAME").unwrap(), "/dev/sda");
        assert_eq!(fields.get("TYPE").unwrap(), "disk");
    }

    fn fake_sysfs() -> Result<tempfile::TempDir> {
        // dm-0 is a verity device over nvme0n1p4 (data) + nvme0n1p5 (hash)
        let td = tempfile::tempdir()?;
        let base = td.path().join("class/block");
        for (dev, slaves) in [
            ("dm-0", Some(&["nvme0n1p4", "nvme0n1p5"][..])),
            ("nvme0n1p4", None),
            ("nvme0n1p5", None),
        ] {
            let d = base.join(dev);
            std::fs::create_dir_all(&d)?;
            if let Some(slaves) = slaves {
                let slavedir = d.join("slaves");
                std::fs::create_dir(&slavedir)?;
                for s in slaves {
                    std::fs::create_dir(slavedir.join(s))?;
                }
            }
        }
        std::fs::write(base.join("nvme0n1p4/partition"), "4\n")?;
        std::fs::write(base.join("nvme0n1p5/partition"), "5\n")?;
        Ok(td)
    }

    #[test]
    fn test_backing_devices() -> Result<()> {
        let td = fake_sysfs()?;
        let sysfs = Utf8Path::from_path(td.path()).unwrap();
        let r = backing_devices_in(sysfs, "dm-0")?;
        assert_eq!(r, vec!["nvme0n1p4".to_string(), "nvme0n1p5".to_string()]);
        // A plain partition resolves to itself
        let r = backing_devices_in(sysfs, "nvme0n1p4")?;
        assert_eq!(r, vec!["nvme0n1p4".to_string()]);
        Ok(())
    }

    #[test]
    fn test_partition_index() -> Result<()> {
        let td = fake_sysfs()?;
        let sysfs = Utf8Path::from_path(td.path()).unwrap();
        assert_eq!(partition_index_in(sysfs, "nvme0n1p4")?, 4);
        assert_eq!(partition_index_in(sysfs, "nvme0n1p5")?, 5);
        assert!(partition_index_in(sysfs, "dm-0").is_err());
        Ok(())
    }
}
