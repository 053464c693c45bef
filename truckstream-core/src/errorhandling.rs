//! Process level handling of errors we can not recover from.

/// Abort as gracefully as possible on a fatal error.
/// Only binaries should call this, library code returns its errors.
pub trait TruckstreamFatal<T, E>: Sized + sealed::Sealed {
    /// Unwrap the value or panic with a full `eyre` report of the error chain.
    fn truckstream_fatal(self) -> T;
}

impl<T, E> TruckstreamFatal<T, E> for Result<T, E>
where
    E: std::fmt::Debug + std::error::Error + Send + Sync + 'static,
{
    fn truckstream_fatal(self) -> T {
        match self {
            Ok(x) => x,
            Err(e) => {
                let report = eyre::Report::new(e);
                tracing::error!("{report:?}");
                panic!("{report:?}")
            }
        }
    }
}

mod sealed {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}
