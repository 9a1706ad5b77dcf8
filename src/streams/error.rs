use std::{error::Error, fmt, sync::Arc};

/// Error type shared by every stream, writer, and controller operation.
///
/// Errors produced by the underlying sink (or by `controller.error`) are
/// carried unchanged as the stream's stored error and surfaced to every
/// pending and future producer operation.
#[derive(Debug, Clone)]
pub enum StreamError {
    /// A close has been requested; no further writes are accepted.
    Closing,
    /// The stream has closed successfully.
    Closed,
    /// The stream is already locked to a writer.
    Locked,
    /// The writer lock has been released; this handle is defunct.
    Released,
    /// The stream was aborted, with the producer-supplied reason.
    Aborted(Option<String>),
    /// A numeric argument was out of range (bad high water mark or chunk size).
    Range(String),
    /// The operation is not valid in the stream's current state.
    InvalidState(&'static str),
    /// The driver future was dropped before the operation completed.
    TaskDropped,
    /// Any other error, usually produced by the underlying sink.
    Other(Arc<dyn Error + Send + Sync>),
}

impl StreamError {
    /// Wrap any error type into `StreamError`
    pub fn other<E>(e: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        StreamError::Other(Arc::new(e))
    }

    /// Wrap a boxed error
    pub fn other_boxed(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        #[derive(Debug)]
        struct SimpleError(String);
        impl fmt::Display for SimpleError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl Error for SimpleError {}
        StreamError::Other(Arc::new(SimpleError(s.to_string())))
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::from(s.as_str())
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::Other(Arc::new(e))
    }
}

impl From<Box<dyn Error + Send + Sync>> for StreamError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

/// Macro for users to add direct `From` implementations for their error types.
/// This allows using `?` directly without `.map_err(StreamError::other)`.
///
/// # Example
/// ```ignore
/// use writable_streams::{StreamError, impl_stream_error_from};
///
/// impl_stream_error_from!(
///     serde_json::Error,
///     reqwest::Error,
/// );
///
/// // Now you can use ? directly:
/// fn example() -> Result<(), StreamError> {
///     let data = serde_json::from_str("{}")?;
///     Ok(())
/// }
/// ```
#[macro_export]
macro_rules! impl_stream_error_from {
    ($($error_type:ty),* $(,)?) => {
        $(
            impl From<$error_type> for $crate::streams::error::StreamError {
                fn from(e: $error_type) -> Self {
                    $crate::streams::error::StreamError::Other(std::sync::Arc::new(e))
                }
            }
        )*
    };
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Closing => write!(f, "Stream is closing"),
            StreamError::Closed => write!(f, "Stream is closed"),
            StreamError::Locked => write!(f, "Stream is already locked to a writer"),
            StreamError::Released => write!(f, "Writer has been released"),
            StreamError::Aborted(Some(reason)) => write!(f, "Stream was aborted: {}", reason),
            StreamError::Aborted(None) => write!(f, "Stream was aborted"),
            StreamError::Range(msg) => write!(f, "{}", msg),
            StreamError::InvalidState(msg) => write!(f, "{}", msg),
            StreamError::TaskDropped => write!(f, "Stream task was dropped"),
            StreamError::Other(err) => write!(f, "{}", err),
        }
    }
}

impl Error for StreamError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StreamError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_conversions_work() {
        let _: StreamError = "error message".into();
        let _: StreamError = String::from("error").into();

        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "io error");
        let _: StreamError = io_err.into();

        #[derive(Debug)]
        struct CustomError;
        impl fmt::Display for CustomError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "custom error")
            }
        }
        impl Error for CustomError {}

        let _: StreamError = StreamError::other(CustomError);
    }

    #[test]
    fn test_question_mark_works() -> Result<(), Box<dyn Error>> {
        fn returns_stream_error() -> Result<(), StreamError> {
            Err("stream error".into())
        }

        returns_stream_error().unwrap_err();
        Ok(())
    }

    #[test]
    fn test_macro_usage_example() -> Result<(), Box<dyn Error>> {
        #[derive(Debug)]
        struct UserCustomError(String);
        impl fmt::Display for UserCustomError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "User error: {}", self.0)
            }
        }
        impl Error for UserCustomError {}

        impl_stream_error_from!(UserCustomError);

        fn user_function() -> Result<(), StreamError> {
            fn might_fail() -> Result<(), UserCustomError> {
                Err(UserCustomError("something went wrong".to_string()))
            }
            might_fail()?;
            Ok(())
        }

        assert!(user_function().is_err());
        Ok(())
    }

    #[test]
    fn test_display_covers_state_errors() {
        assert_eq!(StreamError::Closing.to_string(), "Stream is closing");
        assert_eq!(StreamError::Closed.to_string(), "Stream is closed");
        assert_eq!(
            StreamError::Aborted(Some("disk full".into())).to_string(),
            "Stream was aborted: disk full"
        );
        assert_eq!(
            StreamError::Released.to_string(),
            "Writer has been released"
        );
    }
}
