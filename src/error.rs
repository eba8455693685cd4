use std::borrow::Cow;
use std::error;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FmtResult;
use std::io;
use std::result;


/// A result type using our [`Error`] by default.
pub type Result<T, E = Error> = result::Result<T, E>;


/// An enum providing a rough classification of errors.
///
/// The variants of this type partly resemble those of
/// [`std::io::ErrorKind`], because these are the most common sources of
/// error that the crate concerns itself with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An entity was not found, often a file.
    NotFound,
    /// The operation lacked the necessary privileges to complete.
    PermissionDenied,
    /// Data not valid for the operation were encountered.
    InvalidData,
    /// A parameter was incorrect.
    InvalidInput,
    /// This operation is unsupported on this platform.
    Unsupported,
    /// A custom error that does not fall under any other I/O error
    /// kind.
    Other,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let s = match self {
            Self::NotFound => "entity not found",
            Self::PermissionDenied => "permission denied",
            Self::InvalidData => "invalid data",
            Self::InvalidInput => "invalid input parameter",
            Self::Unsupported => "unsupported",
            Self::Other => "other error",
        };
        f.write_str(s)
    }
}


enum ErrorImpl {
    Io(io::Error),
    /// An error that only carries a kind and a message.
    Static {
        kind: ErrorKind,
        message: Cow<'static, str>,
    },
    /// An error with one layer of context.
    Context {
        context: Cow<'static, str>,
        source: Box<ErrorImpl>,
    },
}

impl ErrorImpl {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(error) => match error.kind() {
                io::ErrorKind::NotFound => ErrorKind::NotFound,
                io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                io::ErrorKind::InvalidData => ErrorKind::InvalidData,
                io::ErrorKind::InvalidInput => ErrorKind::InvalidInput,
                io::ErrorKind::Unsupported => ErrorKind::Unsupported,
                _ => ErrorKind::Other,
            },
            Self::Static { kind, .. } => *kind,
            Self::Context { source, .. } => source.kind(),
        }
    }
}

impl Debug for ErrorImpl {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Io(error) => Debug::fmt(error, f),
            Self::Static { kind, message } => write!(f, "{kind:?}: {message}"),
            Self::Context { context, source } => {
                write!(f, "{context}: ")?;
                Debug::fmt(source, f)
            }
        }
    }
}

impl Display for ErrorImpl {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Io(error) => Display::fmt(error, f),
            Self::Static { message, .. } => f.write_str(message),
            Self::Context { context, source } => {
                write!(f, "{context}: ")?;
                Display::fmt(source, f)
            }
        }
    }
}


/// The error type used by the entire crate.
///
/// Errors generally form a chain, with higher-level errors typically
/// providing additional context for lower-level ones.
pub struct Error {
    error: Box<ErrorImpl>,
}

impl Error {
    fn with_kind<M>(kind: ErrorKind, message: M) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        Self {
            error: Box::new(ErrorImpl::Static {
                kind,
                message: message.into(),
            }),
        }
    }

    /// Create an [`Error`] of kind [`ErrorKind::InvalidData`].
    pub fn with_invalid_data<M>(message: M) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        Self::with_kind(ErrorKind::InvalidData, message)
    }

    /// Create an [`Error`] of kind [`ErrorKind::InvalidInput`].
    pub fn with_invalid_input<M>(message: M) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        Self::with_kind(ErrorKind::InvalidInput, message)
    }

    /// Create an [`Error`] of kind [`ErrorKind::NotFound`].
    pub fn with_not_found<M>(message: M) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        Self::with_kind(ErrorKind::NotFound, message)
    }

    /// Create an [`Error`] of kind [`ErrorKind::Unsupported`].
    pub fn with_unsupported<M>(message: M) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        Self::with_kind(ErrorKind::Unsupported, message)
    }

    /// Retrieve a rough error classification in the form of an
    /// [`ErrorKind`].
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    fn layer_context(self, context: Cow<'static, str>) -> Self {
        Self {
            error: Box::new(ErrorImpl::Context {
                context,
                source: self.error,
            }),
        }
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        Debug::fmt(&self.error, f)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        Display::fmt(&self.error, f)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &*self.error {
            ErrorImpl::Io(error) => error.source(),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(other: io::Error) -> Self {
        Self {
            error: Box::new(ErrorImpl::Io(other)),
        }
    }
}


/// A trait providing ergonomic chaining capabilities to [`Error`].
pub trait ErrorExt: private::Sealed {
    /// The output type produced by [`context`](Self::context) and
    /// [`with_context`](Self::with_context).
    type Output;

    /// Add context to this error.
    fn context<C>(self, context: C) -> Self::Output
    where
        C: Into<Cow<'static, str>>;

    /// Add context to this error, lazily evaluated.
    fn with_context<C, F>(self, f: F) -> Self::Output
    where
        C: Into<Cow<'static, str>>,
        F: FnOnce() -> C;
}

impl ErrorExt for Error {
    type Output = Error;

    fn context<C>(self, context: C) -> Self::Output
    where
        C: Into<Cow<'static, str>>,
    {
        self.layer_context(context.into())
    }

    fn with_context<C, F>(self, f: F) -> Self::Output
    where
        C: Into<Cow<'static, str>>,
        F: FnOnce() -> C,
    {
        self.layer_context(f().into())
    }
}

impl<T, E> ErrorExt for Result<T, E>
where
    E: ErrorExt,
{
    type Output = Result<T, E::Output>;

    fn context<C>(self, context: C) -> Self::Output
    where
        C: Into<Cow<'static, str>>,
    {
        match self {
            Ok(val) => Ok(val),
            Err(err) => Err(err.context(context)),
        }
    }

    fn with_context<C, F>(self, f: F) -> Self::Output
    where
        C: Into<Cow<'static, str>>,
        F: FnOnce() -> C,
    {
        match self {
            Ok(val) => Ok(val),
            Err(err) => Err(err.with_context(f)),
        }
    }
}

impl ErrorExt for io::Error {
    type Output = Error;

    fn context<C>(self, context: C) -> Self::Output
    where
        C: Into<Cow<'static, str>>,
    {
        Error::from(self).context(context)
    }

    fn with_context<C, F>(self, f: F) -> Self::Output
    where
        C: Into<Cow<'static, str>>,
        F: FnOnce() -> C,
    {
        Error::from(self).with_context(f)
    }
}


/// A trait for converting `Option`s into our [`Result`] with a
/// meaningful error attached.
pub trait IntoError<T>: private::Sealed
where
    T: Sized,
{
    /// Convert into an error of kind [`ErrorKind::NotFound`] if absent.
    fn ok_or_not_found<C, F>(self, f: F) -> Result<T>
    where
        C: Into<Cow<'static, str>>,
        F: FnOnce() -> C;

    /// Convert into an error of kind [`ErrorKind::InvalidData`] if
    /// absent.
    fn ok_or_invalid_data<C, F>(self, f: F) -> Result<T>
    where
        C: Into<Cow<'static, str>>,
        F: FnOnce() -> C;

    /// Convert into an error of kind [`ErrorKind::InvalidInput`] if
    /// absent.
    fn ok_or_invalid_input<C, F>(self, f: F) -> Result<T>
    where
        C: Into<Cow<'static, str>>,
        F: FnOnce() -> C;
}

impl<T> IntoError<T> for Option<T> {
    #[inline]
    fn ok_or_not_found<C, F>(self, f: F) -> Result<T>
    where
        C: Into<Cow<'static, str>>,
        F: FnOnce() -> C,
    {
        self.ok_or_else(|| Error::with_not_found(f()))
    }

    #[inline]
    fn ok_or_invalid_data<C, F>(self, f: F) -> Result<T>
    where
        C: Into<Cow<'static, str>>,
        F: FnOnce() -> C,
    {
        self.ok_or_else(|| Error::with_invalid_data(f()))
    }

    #[inline]
    fn ok_or_invalid_input<C, F>(self, f: F) -> Result<T>
    where
        C: Into<Cow<'static, str>>,
        F: FnOnce() -> C,
    {
        self.ok_or_else(|| Error::with_invalid_input(f()))
    }
}


mod private {
    use super::Error;
    use super::Result;

    use std::io;

    pub trait Sealed {}

    impl Sealed for Error {}
    impl Sealed for io::Error {}
    impl<T> Sealed for Option<T> {}
    impl<T, E> Sealed for Result<T, E> where E: Sealed {}
}
