//! MISP attribute to platform observable translation.
//!
//! One attribute becomes zero or more observable descriptors: composite
//! types (`filename|md5`) expand into one descriptor per fragment, binary
//! types become remote-attachment references, and `tlp:*` tags are consumed
//! into the descriptor's TLP marking.

use crate::registry::InstanceConfig;
use crate::taxonomy;
use crate::wire::MispAttribute;
use chrono::{DateTime, Utc};
use mb_core::{ArtifactDescriptor, ArtifactValue};
use regex::Regex;
use std::sync::OnceLock;

const DEFAULT_TLP: u8 = 2;

fn tlp_regex() -> &'static Regex {
    static INSTANCE: OnceLock<Regex> = OnceLock::new();
    INSTANCE.get_or_init(|| Regex::new(r"(?i)^tlp:(white|green|amber|red)").unwrap())
}

/// Converts one remote attribute into platform observable descriptors.
///
/// Attributes already ingested (`timestamp <= since`) and attributes marked
/// deleted on the remote side produce nothing.
pub fn transform_attribute(
    config: &InstanceConfig,
    since: Option<i64>,
    attribute: &MispAttribute,
) -> Vec<ArtifactDescriptor> {
    if attribute.deleted {
        return Vec::new();
    }
    if let Some(since) = since {
        if attribute.timestamp <= since {
            return Vec::new();
        }
    }

    let (tags, tlp) = merge_tags(config, &attribute.tags);
    let start_date = DateTime::from_timestamp(attribute.timestamp, 0).unwrap_or_else(Utc::now);

    if matches!(attribute.attribute_type.as_str(), "attachment" | "malware-sample") {
        return vec![ArtifactDescriptor {
            data_type: "file".to_string(),
            value: ArtifactValue::Remote {
                filename: attribute.value.clone(),
                reference: attribute.id.clone(),
                attachment_type: attribute.attribute_type.clone(),
            },
            message: attribute.comment.clone(),
            tlp,
            tags,
            start_date,
        }];
    }

    let fragments = split_composite(&attribute.attribute_type, &attribute.value);
    let message = composite_message(&attribute.comment, &fragments);

    fragments
        .into_iter()
        .map(|(fragment_type, fragment_value)| {
            let mut tags = tags.clone();
            tags.push(format!("MISP:type={fragment_type}"));
            tags.push(format!("MISP:category={}", attribute.category));
            ArtifactDescriptor {
                data_type: taxonomy::data_type_for(&fragment_type).to_string(),
                value: ArtifactValue::Inline {
                    data: fragment_value,
                },
                message: message.clone(),
                tlp,
                tags,
                start_date,
            }
        })
        .collect()
}

/// Merged tag set for an attribute: the instance marker, the instance's
/// configured tags, then the attribute's own tags. `tlp:*` tags are consumed
/// into the returned TLP level instead of being kept.
fn merge_tags(config: &InstanceConfig, attribute_tags: &[String]) -> (Vec<String>, u8) {
    let mut tlp = DEFAULT_TLP;
    let mut tags = Vec::with_capacity(1 + config.artifact_tags.len() + attribute_tags.len());
    tags.push(format!("src:{}", config.name));

    for tag in config.artifact_tags.iter().chain(attribute_tags.iter()) {
        if let Some(captures) = tlp_regex().captures(tag) {
            tlp = match captures[1].to_ascii_lowercase().as_str() {
                "white" => 0,
                "green" => 1,
                "amber" => 2,
                _ => 3,
            };
        } else if !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }
    (tags, tlp)
}

/// Splits a composite `a|b` type/value into pairs, padding the shorter side
/// so every fragment is emitted.
fn split_composite(attribute_type: &str, value: &str) -> Vec<(String, String)> {
    if !attribute_type.contains('|') {
        return vec![(attribute_type.to_string(), value.to_string())];
    }
    let types: Vec<&str> = attribute_type.split('|').collect();
    let values: Vec<&str> = value.split('|').collect();
    let len = types.len().max(values.len());
    (0..len)
        .map(|i| {
            (
                types.get(i).copied().unwrap_or("noType").to_string(),
                values.get(i).copied().unwrap_or("noValue").to_string(),
            )
        })
        .collect()
}

/// Annotation carried by every fragment of a composite attribute, so each
/// one keeps the full context it was split from.
fn composite_message(comment: &str, fragments: &[(String, String)]) -> String {
    if fragments.len() <= 1 {
        return comment.to_string();
    }
    let summary = fragments
        .iter()
        .map(|(t, v)| format!("{t}: {v}"))
        .collect::<Vec<_>>()
        .join("\n");
    if comment.is_empty() {
        summary
    } else {
        format!("{comment}\n{summary}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::ApiKey;

    fn config() -> InstanceConfig {
        InstanceConfig {
            name: "demo".to_string(),
            base_url: "https://misp.example.com".to_string(),
            api_key: ApiKey::new("k"),
            case_template: None,
            artifact_tags: vec!["intel".to_string()],
            timeout_secs: 30,
            max_retries: 0,
        }
    }

    fn attribute(attr_type: &str, value: &str) -> MispAttribute {
        serde_json::from_value(serde_json::json!({
            "id": "7",
            "type": attr_type,
            "category": "Network activity",
            "value": value,
            "timestamp": 1704067200i64,
        }))
        .unwrap()
    }

    #[test]
    fn simple_attribute_becomes_one_tagged_descriptor() {
        let attr = attribute("ip-dst", "1.2.3.4");
        let out = transform_attribute(&config(), None, &attr);
        assert_eq!(out.len(), 1);
        let descriptor = &out[0];
        assert_eq!(descriptor.data_type, "ip");
        assert_eq!(
            descriptor.value,
            ArtifactValue::Inline {
                data: "1.2.3.4".to_string()
            }
        );
        assert_eq!(descriptor.tlp, 2);
        assert!(descriptor.tags.contains(&"src:demo".to_string()));
        assert!(descriptor.tags.contains(&"intel".to_string()));
        assert!(descriptor.tags.contains(&"MISP:type=ip-dst".to_string()));
        assert!(descriptor
            .tags
            .contains(&"MISP:category=Network activity".to_string()));
    }

    #[test]
    fn since_filter_drops_already_ingested_attributes() {
        let attr = attribute("ip-dst", "1.2.3.4");
        assert!(transform_attribute(&config(), Some(1704067200), &attr).is_empty());
        assert_eq!(transform_attribute(&config(), Some(1704067199), &attr).len(), 1);
    }

    #[test]
    fn deleted_attribute_is_dropped() {
        let mut attr = attribute("ip-dst", "1.2.3.4");
        attr.deleted = true;
        assert!(transform_attribute(&config(), None, &attr).is_empty());
    }

    #[test]
    fn malware_sample_becomes_remote_attachment() {
        let mut attr = attribute("malware-sample", "orig.exe");
        attr.id = "9".to_string();
        let out = transform_attribute(&config(), None, &attr);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data_type, "file");
        assert_eq!(
            out[0].value,
            ArtifactValue::Remote {
                filename: "orig.exe".to_string(),
                reference: "9".to_string(),
                attachment_type: "malware-sample".to_string(),
            }
        );
        assert!(out[0].tags.contains(&"src:demo".to_string()));
    }

    #[test]
    fn composite_expands_with_shared_message() {
        let attr = attribute("filename|md5", "a.exe|d41d8cd98f00b204e9800998ecf8427e");
        let out = transform_attribute(&config(), None, &attr);
        assert_eq!(out.len(), 2);

        let types: Vec<&str> = out.iter().map(|d| d.data_type.as_str()).collect();
        assert_eq!(types, vec!["filename", "hash"]);
        assert_eq!(
            out[0].value,
            ArtifactValue::Inline {
                data: "a.exe".to_string()
            }
        );
        assert_eq!(
            out[1].value,
            ArtifactValue::Inline {
                data: "d41d8cd98f00b204e9800998ecf8427e".to_string()
            }
        );
        for descriptor in &out {
            assert!(descriptor.message.contains("filename: a.exe"));
            assert!(descriptor
                .message
                .contains("md5: d41d8cd98f00b204e9800998ecf8427e"));
        }
    }

    #[test]
    fn composite_padding_fills_missing_sides() {
        assert_eq!(
            split_composite("filename|md5", "a.exe"),
            vec![
                ("filename".to_string(), "a.exe".to_string()),
                ("md5".to_string(), "noValue".to_string())
            ]
        );
        assert_eq!(
            split_composite("filename", "a.exe|extra"),
            vec![("filename".to_string(), "a.exe|extra".to_string())]
        );
        assert_eq!(
            split_composite("regkey|value", "HKLM\\Run|evil|extra"),
            vec![
                ("regkey".to_string(), "HKLM\\Run".to_string()),
                ("value".to_string(), "evil".to_string()),
                ("noType".to_string(), "extra".to_string())
            ]
        );
    }

    #[test]
    fn tlp_tags_are_consumed_into_the_marking() {
        let cases = [
            ("tlp:white", 0u8),
            ("tlp:green", 1),
            ("TLP:AMBER", 2),
            ("tlp:red", 3),
        ];
        for (tag, expected) in cases {
            let mut attr = attribute("ip-dst", "1.2.3.4");
            attr.tags = vec![tag.to_string()];
            let out = transform_attribute(&config(), None, &attr);
            assert_eq!(out[0].tlp, expected, "{tag}");
            assert!(
                !out[0].tags.iter().any(|t| t.eq_ignore_ascii_case(tag)),
                "{tag} must not remain in {:?}",
                out[0].tags
            );
        }
    }

    #[test]
    fn non_tlp_tags_are_kept() {
        let mut attr = attribute("ip-dst", "1.2.3.4");
        attr.tags = vec!["apt".to_string(), "tlp:red".to_string()];
        let out = transform_attribute(&config(), None, &attr);
        assert!(out[0].tags.contains(&"apt".to_string()));
        assert_eq!(out[0].tlp, 3);
    }
}
