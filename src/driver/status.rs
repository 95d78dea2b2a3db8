//! Backend status codes and their messages.

/// Maximum length of an error message, terminator included
pub const ERROR_SIZE: usize = 512;

/// Cache/IRIS call-in statuses
pub mod isc {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = -1;
    pub const ALREADYCON: i32 = -2;
    pub const STRTOOLONG: i32 = -3;
    pub const CONBROKEN: i32 = -4;
    pub const INTERRUPT: i32 = -6;
    pub const NOCON: i32 = -7;
    pub const RETTOOSMALL: i32 = -8;
    pub const ERUNKNOWN: i32 = -9;
    pub const RETTRUNC: i32 = -10;
    pub const NOTINCACHE: i32 = -11;
    pub const BADARG: i32 = -12;
    pub const NORES: i32 = -13;
    pub const EXSTR_INUSE: i32 = -14;
    pub const ACCESSDENIED: i32 = -15;
    pub const CHANGEPASSWORD: i32 = -16;

    pub const ERMXSTR: i32 = 5;
    pub const ERNOLINE: i32 = 8;
    pub const ERUNDEF: i32 = 9;
    pub const ERSYSTEM: i32 = 10;
    pub const ERSUBSCR: i32 = 16;
    pub const ERNOROUTINE: i32 = 17;
    pub const ERSTRINGSTACK: i32 = 20;
    pub const ERUNIMPLEMENTED: i32 = 22;
    pub const ERARGSTACK: i32 = 25;
    pub const ERPROTECT: i32 = 27;
    pub const ERPARAMETER: i32 = 40;
    pub const ERNAMSP: i32 = 83;
    pub const ERBADOREF: i32 = 119;
    pub const ERNOMETHOD: i32 = 120;
    pub const ERNOPROPERTY: i32 = 121;
    pub const ERNOCLASS: i32 = 122;

    pub const ETIMEOUT: i32 = -100;
    pub const BAD_STRING: i32 = -101;
    pub const BAD_NAMESPACE: i32 = -102;
    pub const BAD_GLOBAL: i32 = -103;
    pub const BAD_FUNCTION: i32 = -104;
    pub const BAD_CLASS: i32 = -105;
    pub const BAD_METHOD: i32 = -106;
}

/// YottaDB simple API return codes
pub mod ydb {
    pub const OK: i32 = 0;
    pub const TP_RESTART: i32 = i32::MAX - 1;
    pub const TP_ROLLBACK: i32 = i32::MAX - 2;
    pub const NODE_END: i32 = i32::MAX - 3;
    pub const LOCK_TIMEOUT: i32 = i32::MAX - 4;
    pub const NOTOK: i32 = i32::MAX - 5;

    pub const ERR_GVUNDEF: i32 = -150_372_994;
    pub const ERR_LVUNDEF: i32 = -150_373_850;

    /// Deepest transaction nesting the engine supports
    pub const MAX_TP: usize = 32;
}

/// Transport statuses of the network protocols
pub mod net {
    pub const EOF: i32 = 0;
    pub const NOCON: i32 = -1;
    pub const ERROR: i32 = -2;
    pub const TIMEOUT: i32 = -3;
}

/// Static text for a Cache/IRIS status.
pub fn isc_message(code: i32) -> &'static str {
    use isc::*;
    match code {
        SUCCESS => "Operation completed successfully!",
        ACCESSDENIED => "Authentication has failed. Check the audit log for the real authentication error.",
        ALREADYCON => "Connection already existed. Returned if you call CacheSecureStartH from a $ZF function.",
        CHANGEPASSWORD => "Password change required. This return value is only returned if you are using Cache authentication.",
        CONBROKEN => "Connection was broken by the server. Check arguments for validity.",
        FAILURE => "An unexpected error has occurred.",
        STRTOOLONG => "String is too long.",
        NOCON => "No connection has been established.",
        ERSYSTEM => "Either the Cache engine generated a <SYSTEM> error, or callin detected an internal data inconsistency.",
        ERARGSTACK => "Argument stack overflow.",
        ERSTRINGSTACK => "String stack overflow.",
        ERPROTECT => "Protection violation.",
        ERUNDEF => "Global node is undefined",
        ERUNIMPLEMENTED => "String is undefined OR feature is not implemented.",
        ERSUBSCR => "Subscript error in Global node (subscript null/empty or too long)",
        ERNOROUTINE => "Routine does not exist",
        ERNOLINE => "Function does not exist in routine",
        ERPARAMETER => "Function arguments error",
        BAD_GLOBAL => "Invalid global name",
        BAD_NAMESPACE => "Invalid NameSpace name",
        BAD_FUNCTION => "Invalid function name",
        BAD_CLASS => "Invalid class name",
        BAD_METHOD => "Invalid method name",
        ERNOCLASS => "Class does not exist",
        ERBADOREF => "Invalid Object Reference",
        ERNOMETHOD => "Method does not exist",
        ERNOPROPERTY => "Property does not exist",
        ETIMEOUT => "Operation timed out",
        BAD_STRING => "Invalid string",
        ERNAMSP => "Invalid Namespace",
        _ => "Database Server Error",
    }
}

/// Full message for a Cache/IRIS status: the engine's own translation
/// (when available) followed by the static text.
pub fn isc_error_text(code: i32, native: Option<&str>) -> String {
    let mut message = native.unwrap_or_default().to_string();
    message.push_str(isc_message(code));
    message
}

/// Message of a failed `SecureStart` call, `None` when the status means
/// the session is usable.
pub fn authentication_message(code: i32) -> Option<String> {
    let reason = match code {
        isc::SUCCESS | isc::ALREADYCON => return None,
        isc::ACCESSDENIED => {
            "Access Denied : Check the audit log for the real authentication error"
        }
        isc::CHANGEPASSWORD => "Password Change Required",
        isc::CONBROKEN => "Connection was formed and then broken by the server.",
        isc::FAILURE => "An unexpected error has occurred.",
        isc::STRTOOLONG => "prinp or prout is too long.",
        _ => "Failed",
    };
    Some(format!(
        "Authentication: CacheSecureStart() : {} ({})",
        reason, code
    ))
}

/// True for the statuses that mean "node does not exist" on a get.
pub fn is_undefined(code: i32) -> bool {
    matches!(code, isc::ERUNDEF | ydb::ERR_GVUNDEF | ydb::ERR_LVUNDEF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isc_messages() {
        assert_eq!(isc_message(isc::ERUNDEF), "Global node is undefined");
        assert_eq!(isc_message(isc::BAD_GLOBAL), "Invalid global name");
        assert_eq!(isc_message(isc::ETIMEOUT), "Operation timed out");
        assert_eq!(isc_message(4242), "Database Server Error");
    }

    #[test]
    fn test_native_translation_comes_first() {
        let text = isc_error_text(isc::ERPROTECT, Some("<PROTECT>"));
        assert_eq!(text, "<PROTECT>Protection violation.");
        assert_eq!(isc_error_text(isc::ERPROTECT, None), "Protection violation.");
    }

    #[test]
    fn test_authentication_messages() {
        assert_eq!(authentication_message(isc::SUCCESS), None);
        assert_eq!(authentication_message(isc::ALREADYCON), None);
        assert_eq!(
            authentication_message(isc::CHANGEPASSWORD).as_deref(),
            Some("Authentication: CacheSecureStart() : Password Change Required (-16)")
        );
        assert_eq!(
            authentication_message(-99).as_deref(),
            Some("Authentication: CacheSecureStart() : Failed (-99)")
        );
    }

    #[test]
    fn test_ydb_sentinels() {
        assert_eq!(ydb::TP_RESTART, 2_147_483_646);
        assert_eq!(ydb::NOTOK, 2_147_483_642);
        assert!(is_undefined(ydb::ERR_GVUNDEF));
        assert!(!is_undefined(ydb::NODE_END));
    }
}
