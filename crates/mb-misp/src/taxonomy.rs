//! Bidirectional taxonomy between MISP attribute types and platform
//! observable data types.
//!
//! Both directions are pure match tables so the compiler turns them into
//! jump tables; unknown inputs fall through to `other`.

/// Platform data type for a MISP attribute type.
pub fn data_type_for(misp_type: &str) -> &'static str {
    match misp_type {
        "md5" | "sha1" | "sha256" | "sha224" | "sha384" | "sha512" | "ssdeep" | "imphash"
        | "pehash" | "impfuzzy" => "hash",
        "ip-src" | "ip-dst" => "ip",
        "hostname" | "target-machine" => "fqdn",
        "domain" => "domain",
        "email-src" | "email-dst" | "whois-registrant-email" | "target-email" => "mail",
        "email-subject" => "mail_subject",
        "url" => "url",
        "uri" => "uri_path",
        "user-agent" => "user-agent",
        "filename" => "filename",
        "attachment" | "malware-sample" => "file",
        "regkey" | "regkey|value" => "registry",
        _ => "other",
    }
}

/// MISP `(category, type)` pair for a platform observable. For hashes the
/// type is routed by value length.
pub fn misp_pair_for(data_type: &str, value: &str) -> (&'static str, &'static str) {
    match data_type {
        "hash" => ("Payload delivery", hash_type_for_len(value.len())),
        "filename" => ("Payload delivery", "filename"),
        "mail" => ("Payload delivery", "email-src"),
        "mail_subject" => ("Payload delivery", "email-subject"),
        "file" => ("Payload delivery", "malware-sample"),
        "ip" => ("Network activity", "ip-src"),
        "fqdn" => ("Network activity", "hostname"),
        "domain" => ("Network activity", "domain"),
        "uri_path" => ("Network activity", "uri"),
        "user-agent" => ("Network activity", "user-agent"),
        "url" => ("External analysis", "url"),
        "registry" => ("Persistence mechanism", "regkey"),
        _ => ("Other", "other"),
    }
}

fn hash_type_for_len(len: usize) -> &'static str {
    match len {
        32 => "md5",
        40 => "sha1",
        56 => "sha224",
        64 => "sha256",
        71 => "sha384",
        128 => "sha512",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_families_map_to_hash() {
        for t in [
            "md5", "sha1", "sha256", "sha224", "sha384", "sha512", "ssdeep", "imphash", "pehash",
            "impfuzzy",
        ] {
            assert_eq!(data_type_for(t), "hash", "{t}");
        }
    }

    #[test]
    fn network_and_mail_types() {
        assert_eq!(data_type_for("ip-src"), "ip");
        assert_eq!(data_type_for("ip-dst"), "ip");
        assert_eq!(data_type_for("hostname"), "fqdn");
        assert_eq!(data_type_for("target-machine"), "fqdn");
        assert_eq!(data_type_for("domain"), "domain");
        assert_eq!(data_type_for("email-src"), "mail");
        assert_eq!(data_type_for("whois-registrant-email"), "mail");
        assert_eq!(data_type_for("email-subject"), "mail_subject");
        assert_eq!(data_type_for("uri"), "uri_path");
        assert_eq!(data_type_for("user-agent"), "user-agent");
    }

    #[test]
    fn binary_and_registry_types() {
        assert_eq!(data_type_for("attachment"), "file");
        assert_eq!(data_type_for("malware-sample"), "file");
        assert_eq!(data_type_for("regkey"), "registry");
        assert_eq!(data_type_for("regkey|value"), "registry");
    }

    #[test]
    fn unknown_type_defaults_to_other() {
        assert_eq!(data_type_for("mutex"), "other");
        assert_eq!(data_type_for(""), "other");
    }

    #[test]
    fn hash_length_routing() {
        let cases = [
            (32, "md5"),
            (40, "sha1"),
            (56, "sha224"),
            (64, "sha256"),
            (71, "sha384"),
            (128, "sha512"),
            (12, "other"),
        ];
        for (len, expected) in cases {
            let value = "a".repeat(len);
            assert_eq!(misp_pair_for("hash", &value), ("Payload delivery", expected));
        }
    }

    #[test]
    fn export_pairs() {
        assert_eq!(misp_pair_for("url", "http://x"), ("External analysis", "url"));
        assert_eq!(misp_pair_for("ip", "1.2.3.4"), ("Network activity", "ip-src"));
        assert_eq!(
            misp_pair_for("registry", "HKLM\\Run"),
            ("Persistence mechanism", "regkey")
        );
        assert_eq!(misp_pair_for("file", "a.exe"), ("Payload delivery", "malware-sample"));
        assert_eq!(misp_pair_for("regexp", ".*"), ("Other", "other"));
    }
}
