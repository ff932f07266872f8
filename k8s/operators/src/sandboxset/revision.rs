//! Content hashing of sandbox templates.

use crate::sandboxset::crd::SandboxTemplate;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Content hash of a template, recorded as the set's update revision and
/// stamped onto sandboxes as their template-hash label. 32 bits keeps the
/// label value short; the template types hash their fields in a fixed
/// order, so equal templates always agree.
pub fn template_revision(template: &SandboxTemplate) -> String {
    let mut hasher = DefaultHasher::new();
    template.hash(&mut hasher);
    format!("{:08x}", hasher.finish() as u32)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sandboxset::crd::SandboxRuntimeSpec;

    fn template(image: &str) -> SandboxTemplate {
        SandboxTemplate {
            spec: SandboxRuntimeSpec {
                image: image.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn equal_templates_hash_alike() {
        assert_eq!(
            template_revision(&template("agent:v1")),
            template_revision(&template("agent:v1"))
        );
    }

    #[test]
    fn image_change_moves_the_revision() {
        assert_ne!(
            template_revision(&template("agent:v1")),
            template_revision(&template("agent:v2"))
        );
    }

    #[test]
    fn revision_is_a_short_hex_string() {
        let revision = template_revision(&template("agent:v1"));
        assert_eq!(revision.len(), 8);
        assert!(revision.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
