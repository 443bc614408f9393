use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Declares a string-backed enum with `as_str`, `Display` and `FromStr`.
/// The strings double as the stored column values.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(
                        concat!("unknown ", stringify!($name), " '{}'"),
                        other
                    )),
                }
            }
        }
    };
}

string_enum! {
    /// Who may see a repository and how far its packages are trusted.
    RepoScope {
        Global => "global",
        Workspace => "workspace",
    }
}

string_enum! {
    RepoStatus {
        Active => "active",
        Failed => "failed",
        Deleted => "deleted",
    }
}

string_enum! {
    TemplateStatus {
        Active => "active",
        Suspended => "suspended",
        Deleted => "deleted",
    }
}

string_enum! {
    /// Template-level actions (distinct from per-version workflow actions).
    TemplateAction {
        Suspend => "suspend",
        Recover => "recover",
    }
}

string_enum! {
    /// Workflow state of an app version.
    VersionStatus {
        Draft => "draft",
        Submitted => "submitted",
        Passed => "passed",
        Rejected => "rejected",
        Active => "active",
        Suspended => "suspended",
        Deleted => "deleted",
    }
}

impl VersionStatus {
    /// Content fields of a version are frozen once it leaves `draft`.
    #[must_use]
    pub const fn is_content_frozen(self) -> bool {
        !matches!(self, VersionStatus::Draft)
    }
}

string_enum! {
    VersionAction {
        Submit => "submit",
        Pass => "pass",
        Reject => "reject",
        Release => "release",
        Suspend => "suspend",
        Recover => "recover",
        Delete => "delete",
    }
}

string_enum! {
    ApplicationStatus {
        Creating => "creating",
        Active => "active",
        Upgrading => "upgrading",
        Suspended => "suspended",
        Deleting => "deleting",
        Deleted => "deleted",
        Failed => "failed",
    }
}

impl ApplicationStatus {
    /// Statuses waiting on the orchestrator.
    #[must_use]
    pub const fn is_transitional(self) -> bool {
        matches!(
            self,
            ApplicationStatus::Creating | ApplicationStatus::Upgrading | ApplicationStatus::Deleting
        )
    }

    /// An application in one of these statuses no longer pins its version.
    #[must_use]
    pub const fn is_winding_down(self) -> bool {
        matches!(self, ApplicationStatus::Deleting | ApplicationStatus::Deleted)
    }
}

string_enum! {
    RepoEventKind {
        IndexStart => "index-start",
        IndexProgress => "index-progress",
        IndexComplete => "index-complete",
        IndexFailed => "index-failed",
    }
}
