//! udev rule that lets a group use the keypad without root.

use crate::usb::{PRODUCT_ID, VENDOR_ID};
use anyhow::{bail, Context};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_GROUP: &str = "input";
pub const RULES_PATH: &str = "/etc/udev/rules.d/99-tartarusd.rules";

pub fn rule_text(group: &str) -> String {
    format!(
        "# Written by tartarusd --authorize\n\
         SUBSYSTEM==\"usb\", ATTRS{{idVendor}}==\"{VENDOR_ID:04x}\", ATTRS{{idProduct}}==\"{PRODUCT_ID:04x}\", MODE=\"0660\", GROUP=\"{group}\"\n\
         SUBSYSTEM==\"input\", ATTRS{{idVendor}}==\"{VENDOR_ID:04x}\", ATTRS{{idProduct}}==\"{PRODUCT_ID:04x}\", MODE=\"0660\", GROUP=\"{group}\"\n\
         KERNEL==\"uinput\", SUBSYSTEM==\"misc\", MODE=\"0660\", GROUP=\"{group}\"\n"
    )
}

fn valid_group(group: &str) -> bool {
    !group.is_empty()
        && group
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Write the rule for `group` to `path`.
pub fn authorize(group: &str, path: &Path) -> anyhow::Result<PathBuf> {
    if !valid_group(group) {
        bail!("invalid group name: {group:?}");
    }
    fs::write(path, rule_text(group))
        .with_context(|| format!("failed to write {} (are you root?)", path.display()))?;
    Ok(path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_matches_keypad() {
        let rule = rule_text("plugdev");
        assert!(rule.contains(r#"ATTRS{idVendor}=="1532""#));
        assert!(rule.contains(r#"ATTRS{idProduct}=="0201""#));
        assert!(rule.contains(r#"GROUP="plugdev""#));
        assert_eq!(rule.lines().filter(|l| l.contains("MODE=")).count(), 3);
    }

    #[test]
    fn writes_rule_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("99-test.rules");
        authorize(DEFAULT_GROUP, &path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), rule_text("input"));
    }

    #[test]
    fn rejects_bad_group_names() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("99-test.rules");
        assert!(authorize("", &path).is_err());
        assert!(authorize("wheel\", RUN+=\"/bin/sh", &path).is_err());
        assert!(!path.exists());
    }
}
