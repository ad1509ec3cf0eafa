//! Platform and Buildpack API version gate.
//!
//! Both API classes use `<major>.<minor>` versions. A declared version is
//! compatible when it parses and lies inside the inclusive range this binary
//! supports for its class.

use crate::buildpack::BuildpackRef;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Platform API assumed when the platform does not declare one.
pub const DEFAULT_PLATFORM_API: &str = "0.3";
/// Buildpack API assumed for buildpacks that do not declare one.
pub const DEFAULT_BUILDPACK_API: &str = "0.2";

pub const SUPPORTED_PLATFORM_APIS: ApiRange = ApiRange {
    min: ApiVersion::new(0, 3),
    max: ApiVersion::new(0, 4),
};

pub const SUPPORTED_BUILDPACK_APIS: ApiRange = ApiRange {
    min: ApiVersion::new(0, 2),
    max: ApiVersion::new(0, 4),
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKind {
    Platform,
    Buildpack,
}

impl fmt::Display for ApiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiKind::Platform => write!(f, "platform"),
            ApiKind::Buildpack => write!(f, "buildpack"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid {kind} API version '{value}'")]
    Parse { kind: ApiKind, value: String },
    #[error("incompatible platform API {declared}: this lifecycle supports {supported}")]
    IncompatiblePlatform {
        declared: ApiVersion,
        supported: ApiRange,
    },
    #[error(
        "buildpack {buildpack} declares incompatible buildpack API {declared}: this lifecycle supports {supported}"
    )]
    IncompatibleBuildpack {
        buildpack: String,
        declared: ApiVersion,
        supported: ApiRange,
    },
}

impl ApiError {
    pub fn kind(&self) -> ApiKind {
        match self {
            ApiError::Parse { kind, .. } => *kind,
            ApiError::IncompatiblePlatform { .. } => ApiKind::Platform,
            ApiError::IncompatibleBuildpack { .. } => ApiKind::Buildpack,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl FromStr for ApiVersion {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (major, minor) = match s.split_once('.') {
            Some((major, minor)) => (major, minor),
            None => (s, "0"),
        };
        let major = major.parse::<u32>().map_err(|_| ())?;
        let minor = minor.parse::<u32>().map_err(|_| ())?;
        Ok(Self::new(major, minor))
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiRange {
    pub min: ApiVersion,
    pub max: ApiVersion,
}

impl ApiRange {
    pub fn contains(&self, version: ApiVersion) -> bool {
        self.min <= version && version <= self.max
    }
}

impl fmt::Display for ApiRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

fn parse(kind: ApiKind, declared: &str) -> Result<ApiVersion, ApiError> {
    declared.parse().map_err(|()| ApiError::Parse {
        kind,
        value: declared.to_owned(),
    })
}

/// Verify the platform API declared for this invocation.
pub fn verify_platform_api(declared: &str) -> Result<ApiVersion, ApiError> {
    let version = parse(ApiKind::Platform, declared)?;
    if SUPPORTED_PLATFORM_APIS.contains(version) {
        Ok(version)
    } else {
        Err(ApiError::IncompatiblePlatform {
            declared: version,
            supported: SUPPORTED_PLATFORM_APIS,
        })
    }
}

/// Verify the buildpack API declared by `buildpack`. An undeclared (`None` or
/// empty) API is treated as [`DEFAULT_BUILDPACK_API`].
pub fn verify_buildpack_api(buildpack: &str, declared: Option<&str>) -> Result<ApiVersion, ApiError> {
    let declared = match declared {
        Some(api) if !api.trim().is_empty() => api,
        _ => DEFAULT_BUILDPACK_API,
    };
    let version = parse(ApiKind::Buildpack, declared)?;
    if SUPPORTED_BUILDPACK_APIS.contains(version) {
        Ok(version)
    } else {
        Err(ApiError::IncompatibleBuildpack {
            buildpack: buildpack.to_owned(),
            declared: version,
            supported: SUPPORTED_BUILDPACK_APIS,
        })
    }
}

/// Check every buildpack of a group before any of them runs. Entries without
/// an `api` are taken as [`DEFAULT_BUILDPACK_API`].
pub fn verify_group_apis(group: &[BuildpackRef]) -> Result<(), ApiError> {
    for entry in group {
        verify_buildpack_api(&entry.to_string(), entry.api.as_deref())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_major_minor() {
        assert_eq!("0.3".parse::<ApiVersion>(), Ok(ApiVersion::new(0, 3)));
        assert_eq!("1".parse::<ApiVersion>(), Ok(ApiVersion::new(1, 0)));
        assert!("x.y".parse::<ApiVersion>().is_err());
        assert!("".parse::<ApiVersion>().is_err());
    }

    #[test]
    fn versions_order_numerically() {
        assert!(ApiVersion::new(0, 10) > ApiVersion::new(0, 9));
        assert!(ApiVersion::new(1, 0) > ApiVersion::new(0, 99));
    }

    #[test]
    fn default_platform_api_is_supported() {
        assert!(verify_platform_api(DEFAULT_PLATFORM_API).is_ok());
    }

    #[test]
    fn platform_api_out_of_range_is_incompatible() {
        let err = verify_platform_api("0.2").unwrap_err();
        assert!(matches!(err, ApiError::IncompatiblePlatform { .. }));
        assert_eq!(err.kind(), ApiKind::Platform);
        assert!(verify_platform_api("9.0").is_err());
    }

    #[test]
    fn unparsable_platform_api_is_parse_error() {
        let err = verify_platform_api("latest").unwrap_err();
        assert!(matches!(err, ApiError::Parse { .. }));
        assert!(err.to_string().contains("latest"));
    }

    #[test]
    fn undeclared_buildpack_api_defaults_to_legacy() {
        assert_eq!(
            verify_buildpack_api("example/node", None).unwrap(),
            ApiVersion::new(0, 2)
        );
        assert_eq!(
            verify_buildpack_api("example/node", Some("")).unwrap(),
            ApiVersion::new(0, 2)
        );
    }

    #[test]
    fn incompatible_buildpack_api_names_buildpack() {
        let err = verify_buildpack_api("example/node", Some("0.1")).unwrap_err();
        assert_eq!(err.kind(), ApiKind::Buildpack);
        let msg = err.to_string();
        assert!(msg.contains("example/node"));
        assert!(msg.contains("0.1"));
    }

    #[test]
    fn group_check_stops_at_first_incompatible_entry() {
        let group = vec![
            BuildpackRef::new("a", "1"),
            BuildpackRef::new("b", "1").with_api("0.1"),
            BuildpackRef::new("c", "1").with_api("bogus"),
        ];
        let err = verify_group_apis(&group).unwrap_err();
        assert!(matches!(err, ApiError::IncompatibleBuildpack { ref buildpack, .. } if buildpack == "b@1"));
        assert!(verify_group_apis(&group[..1]).is_ok());
        assert!(verify_group_apis(&[]).is_ok());
    }

    #[test]
    fn range_bounds_are_inclusive() {
        assert!(SUPPORTED_BUILDPACK_APIS.contains(ApiVersion::new(0, 2)));
        assert!(SUPPORTED_BUILDPACK_APIS.contains(ApiVersion::new(0, 4)));
        assert!(!SUPPORTED_BUILDPACK_APIS.contains(ApiVersion::new(0, 5)));
    }
}
