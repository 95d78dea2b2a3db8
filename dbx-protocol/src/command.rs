use serde::{Deserialize, Serialize};

/// Operation carried in the fifth byte of a request prefix.
///
/// The numeric codes are shared with remote peers of the primary protocol,
/// so they must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Command {
    Open = 1,
    Close = 2,
    GetNamespace = 3,
    SetNamespace = 4,
    Set = 11,
    Get = 12,
    Next = 13,
    Previous = 14,
    Delete = 15,
    Defined = 16,
    Increment = 17,
    Lock = 18,
    Unlock = 19,
    NextNode = 21,
    PreviousNode = 22,
    Function = 31,
    ClassMethod = 41,
    GetProperty = 42,
    SetProperty = 43,
    Method = 44,
    CloseInstance = 45,
    TStart = 61,
    TLevel = 62,
    TCommit = 63,
    TRollback = 64,
}

impl Command {
    pub fn from_code(code: u8) -> Option<Self> {
        use Command::*;
        let cmd = match code {
            1 => Open,
            2 => Close,
            3 => GetNamespace,
            4 => SetNamespace,
            11 => Set,
            12 => Get,
            13 => Next,
            14 => Previous,
            15 => Delete,
            16 => Defined,
            17 => Increment,
            18 => Lock,
            19 => Unlock,
            21 => NextNode,
            22 => PreviousNode,
            31 => Function,
            41 => ClassMethod,
            42 => GetProperty,
            43 => SetProperty,
            44 => Method,
            45 => CloseInstance,
            61 => TStart,
            62 => TLevel,
            63 => TCommit,
            64 => TRollback,
            _ => return None,
        };
        Some(cmd)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// Command string used by the legacy gateway. `"*"` marks operations the
    /// gateway does not implement.
    pub fn gateway_code(self) -> &'static str {
        match self {
            Command::Set => "S",
            Command::Get => "G",
            Command::Next => "O",
            Command::Previous => "P",
            Command::Delete => "K",
            Command::Defined => "D",
            Command::Increment => "I",
            Command::TStart => "a",
            Command::TLevel => "b",
            Command::TCommit => "c",
            Command::TRollback => "d",
            Command::Function => "X",
            Command::ClassMethod => "x",
            Command::GetNamespace => "gns",
            Command::SetNamespace => "sns",
            _ => "*",
        }
    }

    /// Commands that only make sense against Cache/IRIS object support.
    pub fn is_object_operation(self) -> bool {
        matches!(
            self,
            Command::ClassMethod
                | Command::Method
                | Command::GetProperty
                | Command::SetProperty
                | Command::CloseInstance
        )
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Open => "open",
            Command::Close => "close",
            Command::GetNamespace => "getnamespace",
            Command::SetNamespace => "setnamespace",
            Command::Set => "set",
            Command::Get => "get",
            Command::Next => "next",
            Command::Previous => "previous",
            Command::Delete => "delete",
            Command::Defined => "defined",
            Command::Increment => "increment",
            Command::Lock => "lock",
            Command::Unlock => "unlock",
            Command::NextNode => "next_node",
            Command::PreviousNode => "previous_node",
            Command::Function => "function",
            Command::ClassMethod => "classmethod",
            Command::GetProperty => "getproperty",
            Command::SetProperty => "setproperty",
            Command::Method => "method",
            Command::CloseInstance => "closeinstance",
            Command::TStart => "tstart",
            Command::TLevel => "tlevel",
            Command::TCommit => "tcommit",
            Command::TRollback => "trollback",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_survive_lookup() {
        for code in 0..=u8::MAX {
            if let Some(cmd) = Command::from_code(code) {
                assert_eq!(cmd.code(), code);
            }
        }
        assert_eq!(Command::from_code(20), None);
        assert_eq!(Command::from_code(0), None);
    }

    #[test]
    fn test_gateway_codes() {
        assert_eq!(Command::Get.gateway_code(), "G");
        assert_eq!(Command::Next.gateway_code(), "O");
        assert_eq!(Command::TRollback.gateway_code(), "d");
        assert_eq!(Command::GetNamespace.gateway_code(), "gns");
        assert_eq!(Command::Method.gateway_code(), "*");
        assert_eq!(Command::Close.gateway_code(), "*");
    }
}
