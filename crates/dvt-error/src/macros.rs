/// dv_err!(code, msg) constructs a user-facing [DvError], to be used for
/// further processing, e.g. typically used in `.map_err(|_| dv_err!(..))`, etc
#[macro_export]
macro_rules! dv_err {
    ($code:expr, $($arg:tt)*) => {
        Box::new($crate::DvError::new(
            $code,
            format!($($arg)*),
        ))
    };
    (code => $code:expr, loc => $location:expr, $($arg:tt)*) => {
        Box::new($crate::DvError::new(
            $code,
            format!($($arg)*),
        ).with_location($location))
    };
}

/// err! constructs a user-facing [DvError] and immediately wraps it in an
/// `Err` variant of a `Result`, typically used in `return err!(...)`, etc
#[macro_export]
macro_rules! err {
    ($code:expr, $($arg:tt)*) => {
        Err($crate::dv_err!($code, $($arg)*))
    };
    (code => $code:expr, loc => $location:expr, $($arg:tt)*) => {
        Err($crate::dv_err!(code => $code, loc => $location, $($arg)*))
    };
}

#[macro_export]
macro_rules! unexpected_err {
    ($($arg:tt)*) => {
        Err($crate::unexpected_dv_err!($($arg)*))
    }
}

#[macro_export]
macro_rules! unexpected_dv_err {
    ($($arg:tt)*) => {
        Box::new($crate::DvError::new(
            $crate::ErrorCode::Unexpected,
            format!($($arg)*),
        ))
    }
}

#[cfg(test)]
mod tests {
    use crate::{DvResult, ErrorCode, SourceLocation};

    fn fails() -> DvResult<()> {
        err!(ErrorCode::InvalidArgument, "batch size must be > 0, got {}", 0)
    }

    #[test]
    fn test_err_macro() {
        let e = fails().unwrap_err();
        assert_eq!(e.code, ErrorCode::InvalidArgument);
        assert_eq!(e.to_string(), "batch size must be > 0, got 0");
    }

    #[test]
    fn test_located_err() {
        let e = dv_err!(
            code => ErrorCode::SqlSyntaxError,
            loc => SourceLocation::new(1, 8, 7),
            "expected FROM"
        );
        assert_eq!(e.location, Some(SourceLocation::new(1, 8, 7)));
    }

    #[test]
    fn test_unexpected_is_bug() {
        let e = unexpected_dv_err!("tier {} vanished", 3);
        assert!(e.code.is_bug());
        assert_eq!(e.to_string(), "tier 3 vanished");
    }
}
