use crate::CoreError;
use std::fmt;
use std::path::PathBuf;

/// The lifecycle phases, in the order `create` runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Detect,
    Analyze,
    Restore,
    Build,
    Export,
    Rebase,
    Create,
}

/// Records exchanged between phases through the layers directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Record {
    Group,
    Plan,
    Analyzed,
    BuildMetadata,
    Report,
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Record::Group => "group",
            Record::Plan => "plan",
            Record::Analyzed => "analyzed",
            Record::BuildMetadata => "build metadata",
            Record::Report => "report",
        })
    }
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::Detect,
        Phase::Analyze,
        Phase::Restore,
        Phase::Build,
        Phase::Export,
        Phase::Rebase,
        Phase::Create,
    ];

    /// Subcommand name.
    pub fn name(self) -> &'static str {
        match self {
            Phase::Detect => "detect",
            Phase::Analyze => "analyze",
            Phase::Restore => "restore",
            Phase::Build => "build",
            Phase::Export => "export",
            Phase::Rebase => "rebase",
            Phase::Create => "create",
        }
    }

    /// Name of the dedicated entry point for this phase.
    pub fn binary(self) -> &'static str {
        match self {
            Phase::Detect => "detector",
            Phase::Analyze => "analyzer",
            Phase::Restore => "restorer",
            Phase::Build => "builder",
            Phase::Export => "exporter",
            Phase::Rebase => "rebaser",
            Phase::Create => "creator",
        }
    }

    /// Accepts either the subcommand or the entry point name.
    pub fn parse(s: &str) -> Option<Phase> {
        Phase::ALL
            .into_iter()
            .find(|p| p.name() == s || p.binary() == s)
    }

    /// Records an earlier phase must have written before this one can run.
    pub fn inputs(self) -> &'static [Record] {
        match self {
            Phase::Detect | Phase::Analyze | Phase::Rebase | Phase::Create => &[],
            Phase::Restore => &[Record::Group, Record::Analyzed],
            Phase::Build => &[Record::Group, Record::Plan],
            Phase::Export => &[Record::Analyzed, Record::BuildMetadata],
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Check that every input record of `phase` exists, using `locate` to find
/// each record on disk.
pub fn validate_inputs(phase: Phase, locate: impl Fn(Record) -> PathBuf) -> Result<(), CoreError> {
    for record in phase.inputs() {
        let path = locate(*record);
        if !path.is_file() {
            return Err(CoreError::InvalidInput(format!(
                "{phase} needs the {record} record at {}; run the earlier phases first",
                path.display()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_both_names() {
        assert_eq!(Phase::parse("detect"), Some(Phase::Detect));
        assert_eq!(Phase::parse("detector"), Some(Phase::Detect));
        assert_eq!(Phase::parse("creator"), Some(Phase::Create));
        assert_eq!(Phase::parse("launch"), None);
        for phase in Phase::ALL {
            assert_eq!(Phase::parse(phase.binary()), Some(phase));
        }
    }

    #[test]
    fn missing_input_is_invalid_input() {
        let dir = tempfile::tempdir().unwrap();
        let locate = |r: Record| -> PathBuf { dir.path().join(format!("{r}.toml")) };
        assert!(validate_inputs(Phase::Detect, locate).is_ok());

        let err = validate_inputs(Phase::Build, locate).unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(ref m) if m.contains("group")));

        std::fs::write(dir.path().join("group.toml"), "").unwrap();
        std::fs::write(dir.path().join("plan.toml"), "").unwrap();
        assert!(validate_inputs(Phase::Build, locate).is_ok());
    }
}
