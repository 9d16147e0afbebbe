//! KN-005: URN codec, the address of every account, project, environment,
//! application, resource, and resource output.
//!
//! Canonical form:
//!
//! ```text
//! urn:<account>:<project>:<environment>:<application>:<type>/<subtype>:<parent>/<resource>:<output>
//! ```
//!
//! Empty trailing segments are trimmed. Parsing is the inverse of formatting.

use super::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

const SCHEME: &str = "urn";
const MAX_SEGMENTS: usize = 7;

/// Unique resource name.
#[derive(Debug, Clone, Default)]
pub struct Urn {
    pub account_id: String,
    pub project: String,
    pub environment: String,
    pub application: String,
    pub resource_type: String,
    pub subtype: String,
    pub parent_resource_id: String,
    pub resource_id: String,
    pub output: String,
}

/// What level of the hierarchy a URN addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrnKind {
    Account,
    Project,
    Environment,
    ApplicationEnvironment,
    Resource,
    Output,
    Type,
    Unknown,
}

impl fmt::Display for UrnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Account => write!(f, "account"),
            Self::Project => write!(f, "project"),
            Self::Environment => write!(f, "environment"),
            Self::ApplicationEnvironment => write!(f, "application_environment"),
            Self::Resource => write!(f, "resource"),
            Self::Output => write!(f, "output"),
            Self::Type => write!(f, "type"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl Urn {
    /// Parse a URN string.
    pub fn parse(s: &str) -> Result<Self> {
        let mut segments: Vec<&str> = s.split(':').collect();
        if segments.first() == Some(&SCHEME) {
            segments.remove(0);
        }

        if segments.len() < 2 || segments[0].is_empty() || segments[1].is_empty() {
            return Err(Error::address(s, "account and project are required"));
        }
        if segments.len() > MAX_SEGMENTS {
            return Err(Error::address(s, "too many segments"));
        }

        let mut urn = Urn {
            account_id: segments[0].to_string(),
            project: segments[1].to_string(),
            ..Default::default()
        };

        let segment = |i: usize| segments.get(i).copied().filter(|s| !s.is_empty());

        if let Some(env) = segment(2) {
            urn.environment = env.to_string();
        }
        if let Some(app) = segment(3) {
            urn.application = app.to_string();
        }
        if let Some(type_pair) = segment(4) {
            let parts: Vec<&str> = type_pair.split('/').collect();
            if parts.len() != 2 || parts.iter().any(|p| p.is_empty()) {
                return Err(Error::address(s, "type must be <type>/<subtype>"));
            }
            urn.resource_type = parts[0].to_string();
            urn.subtype = parts[1].to_string();
        }
        if let Some(resource) = segment(5) {
            let parts: Vec<&str> = resource.split('/').collect();
            if parts.iter().any(|p| p.is_empty()) {
                return Err(Error::address(s, "resource must be [<parent>/]<id>"));
            }
            if parts.len() == 2 {
                urn.parent_resource_id = parts[0].to_string();
                urn.resource_id = parts[1].to_string();
            } else {
                urn.resource_id = resource.to_string();
            }
        }
        if let Some(output) = segment(6) {
            urn.output = output.to_string();
        }

        Ok(urn)
    }

    /// A copy addressing `output` of the same resource.
    pub fn with_output(&self, output: &str) -> Urn {
        Urn {
            output: output.to_string(),
            ..self.clone()
        }
    }

    /// The owning resource's URN.
    pub fn without_output(&self) -> Urn {
        self.with_output("")
    }

    pub fn kind(&self) -> UrnKind {
        let filled = |s: &str| !s.is_empty();
        let has_type = filled(&self.resource_type) && filled(&self.subtype);

        if self.is_resource() {
            return UrnKind::Resource;
        }
        if has_type && filled(&self.resource_id) && filled(&self.output) {
            return UrnKind::Output;
        }
        if has_type || filled(&self.resource_type) {
            if !filled(&self.resource_id) && !filled(&self.output) {
                return UrnKind::Type;
            }
            return UrnKind::Unknown;
        }
        match (
            filled(&self.account_id),
            filled(&self.project),
            filled(&self.environment),
            filled(&self.application),
        ) {
            (true, true, true, true) => UrnKind::ApplicationEnvironment,
            (true, true, true, false) => UrnKind::Environment,
            (true, true, false, false) => UrnKind::Project,
            (true, false, false, false) => UrnKind::Account,
            _ => UrnKind::Unknown,
        }
    }

    /// A resource: typed, named, without an output.
    pub fn is_resource(&self) -> bool {
        !self.account_id.is_empty()
            && !self.project.is_empty()
            && !self.resource_type.is_empty()
            && !self.subtype.is_empty()
            && !self.resource_id.is_empty()
            && self.output.is_empty()
    }

    pub fn is_output(&self) -> bool {
        self.kind() == UrnKind::Output
    }

    /// Relative directory for per-application artifacts:
    /// `project/application/environment`, stopping at the first empty part.
    pub fn path(&self) -> std::path::PathBuf {
        [
            self.project.as_str(),
            self.application.as_str(),
            self.environment.as_str(),
        ]
        .iter()
        .take_while(|p| !p.is_empty())
        .collect()
    }
}

impl fmt::Display for Urn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let type_pair = if !self.resource_type.is_empty() && !self.subtype.is_empty() {
            format!("{}/{}", self.resource_type, self.subtype)
        } else {
            String::new()
        };
        let resource = if !self.parent_resource_id.is_empty() && !self.resource_id.is_empty() {
            format!("{}/{}", self.parent_resource_id, self.resource_id)
        } else {
            self.resource_id.clone()
        };

        let joined = [
            SCHEME,
            self.account_id.as_str(),
            self.project.as_str(),
            self.environment.as_str(),
            self.application.as_str(),
            type_pair.as_str(),
            resource.as_str(),
            self.output.as_str(),
        ]
        .join(":");
        f.write_str(joined.trim_end_matches(':'))
    }
}

impl FromStr for Urn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Urn::parse(s)
    }
}

// Identity is the canonical string.
impl PartialEq for Urn {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Eq for Urn {}

impl Hash for Urn {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_string().hash(state);
    }
}

impl PartialOrd for Urn {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Urn {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl Serialize for Urn {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Urn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Urn::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Classification of a dependency address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressKind {
    /// Names a resource or one of its outputs.
    Resource(Urn),
    /// Anything else: deferred-value ids, partial URNs, garbage.
    Opaque,
}

impl AddressKind {
    pub fn classify(address: &str) -> Self {
        match Urn::parse(address) {
            Ok(urn) if !urn.resource_id.is_empty() => Self::Resource(urn),
            _ => Self::Opaque,
        }
    }

    /// The owning resource, output stripped.
    pub fn resource(&self) -> Option<Urn> {
        match self {
            Self::Resource(urn) => Some(urn.without_output()),
            Self::Opaque => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bucket() -> Urn {
        Urn {
            account_id: "acct".into(),
            project: "proj".into(),
            environment: "env".into(),
            resource_type: "construct".into(),
            subtype: "Bucket".into(),
            resource_id: "my-bucket".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_kn005_format_skips_empty_application() {
        assert_eq!(
            bucket().to_string(),
            "urn:acct:proj:env::construct/Bucket:my-bucket"
        );
    }

    #[test]
    fn test_kn005_format_trims_trailing() {
        let urn = Urn {
            account_id: "acct".into(),
            project: "proj".into(),
            ..Default::default()
        };
        assert_eq!(urn.to_string(), "urn:acct:proj");
    }

    #[test]
    fn test_kn005_parse_full() {
        let urn = Urn::parse("urn:acct:proj:env:app:construct/Bucket:parent/child:Arn").unwrap();
        assert_eq!(urn.account_id, "acct");
        assert_eq!(urn.application, "app");
        assert_eq!(urn.resource_type, "construct");
        assert_eq!(urn.subtype, "Bucket");
        assert_eq!(urn.parent_resource_id, "parent");
        assert_eq!(urn.resource_id, "child");
        assert_eq!(urn.output, "Arn");
        assert_eq!(urn.kind(), UrnKind::Output);
    }

    #[test]
    fn test_kn005_parse_without_scheme() {
        let urn = Urn::parse("acct:proj:env").unwrap();
        assert_eq!(urn.environment, "env");
        assert_eq!(urn.kind(), UrnKind::Environment);
    }

    #[test]
    fn test_kn005_parse_rejects_short() {
        assert!(matches!(
            Urn::parse("urn:acct"),
            Err(Error::AddressFormat { .. })
        ));
        assert!(Urn::parse("urn::proj").is_err());
        assert!(Urn::parse("5b0c5c9e-6d11-4a8c-b2f4-2f6f1a0c7e11").is_err());
    }

    #[test]
    fn test_kn005_parse_rejects_bad_type() {
        let err = Urn::parse("urn:a:p:e:app:construct:x").unwrap_err();
        assert!(err.to_string().contains("type"));
    }

    #[test]
    fn test_kn005_parse_rejects_empty_parts() {
        for s in [
            "urn:a:p:e:app:Bucket/:r",
            "urn:a:p:e:app:/sub:r",
            "urn:a:p:e:app:t/s:parent/",
            "urn:a:p:e:app:t/s:/r",
        ] {
            assert!(Urn::parse(s).is_err(), "{} should not parse", s);
        }
    }

    #[test]
    fn test_kn005_parse_rejects_too_many() {
        assert!(Urn::parse("urn:a:p:e:app:t/s:r:o:extra").is_err());
    }

    #[test]
    fn test_kn005_with_output_keeps_identity() {
        let base = bucket();
        let out = base.with_output("BucketName");
        assert_eq!(out.to_string(), format!("{}:BucketName", base));
        assert_ne!(out, base);
        assert_eq!(out.without_output(), base);
        assert_eq!(base.kind(), UrnKind::Resource);
    }

    #[test]
    fn test_kn005_equality_is_canonical() {
        let mut a = bucket();
        a.subtype = String::new();
        let mut b = bucket();
        b.resource_type = String::new();
        // neither renders a type pair
        assert_eq!(a, b);
    }

    #[test]
    fn test_kn005_kinds() {
        assert_eq!(Urn::parse("urn:a").map(|u| u.kind()).ok(), None);
        assert_eq!(Urn::parse("urn:a:p").unwrap().kind(), UrnKind::Project);
        assert_eq!(
            Urn::parse("urn:a:p:e:app").unwrap().kind(),
            UrnKind::ApplicationEnvironment
        );
        assert_eq!(
            Urn::parse("urn:a:p:e:app:construct/Bucket").unwrap().kind(),
            UrnKind::Type
        );
    }

    #[test]
    fn test_kn005_address_kind() {
        let addr = format!("{}:BucketName", bucket());
        assert_eq!(AddressKind::classify(&addr).resource(), Some(bucket()));
        assert_eq!(
            AddressKind::classify("0a1b2c3d-0000-4000-8000-000000000000"),
            AddressKind::Opaque
        );
        assert_eq!(AddressKind::classify("urn:a:p:e"), AddressKind::Opaque);
    }

    #[test]
    fn test_kn005_serde_as_string() {
        let yaml = serde_yaml_ng::to_string(&bucket()).unwrap();
        assert!(yaml.contains("urn:acct:proj:env::construct/Bucket:my-bucket"));
        let back: Urn = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(back, bucket());
        assert!(serde_yaml_ng::from_str::<Urn>("nope").is_err());
    }

    #[test]
    fn test_kn005_path() {
        let urn = Urn::parse("urn:a:proj:dev:app").unwrap();
        assert_eq!(urn.path(), std::path::PathBuf::from("proj/app/dev"));
        let partial = Urn::parse("urn:a:proj").unwrap();
        assert_eq!(partial.path(), std::path::PathBuf::from("proj"));
    }

    fn segment() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9._-]{1,12}"
    }

    fn optional_segment() -> impl Strategy<Value = String> {
        prop_oneof![Just(String::new()), segment()]
    }

    proptest! {
        #[test]
        fn prop_kn005_roundtrip(
            account in segment(),
            project in segment(),
            environment in optional_segment(),
            application in optional_segment(),
            typed in proptest::option::of((segment(), segment())),
            parent in optional_segment(),
            resource in optional_segment(),
            output in optional_segment(),
        ) {
            let (resource_type, subtype) = typed.unwrap_or_default();
            // a parent only round-trips alongside a resource id
            let parent_resource_id = if resource.is_empty() { String::new() } else { parent };
            let urn = Urn {
                account_id: account,
                project,
                environment,
                application,
                resource_type,
                subtype,
                parent_resource_id,
                resource_id: resource,
                output,
            };
            let parsed = Urn::parse(&urn.to_string()).unwrap();
            prop_assert_eq!(&parsed.resource_id, &urn.resource_id);
            prop_assert_eq!(&parsed.parent_resource_id, &urn.parent_resource_id);
            prop_assert_eq!(&parsed.output, &urn.output);
            prop_assert_eq!(parsed, urn);
        }
    }
}
