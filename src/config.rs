use crate::engine::{CallArgs, CallOptions};
use crate::metadata::Metadata;

/// Defaults a reactive client applies at every call boundary.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    default_metadata: Metadata,
    default_options: Option<CallOptions>,
    cancel_on_unsubscribe: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_metadata: Metadata::new(),
            default_options: None,
            cancel_on_unsubscribe: true,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata sent when a call does not supply its own.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.default_metadata = metadata;
        self
    }

    /// Options sent when a call does not supply its own.
    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.default_options = Some(options);
        self
    }

    /// Whether dropping a response stream early cancels the call.
    pub fn cancel_on_unsubscribe(mut self, enabled: bool) -> Self {
        self.cancel_on_unsubscribe = enabled;
        self
    }

    pub fn default_metadata(&self) -> &Metadata {
        &self.default_metadata
    }

    pub fn default_options(&self) -> Option<&CallOptions> {
        self.default_options.as_ref()
    }

    pub fn cancels_on_unsubscribe(&self) -> bool {
        self.cancel_on_unsubscribe
    }

    /// Resolves the stub arity for one call: metadata is always passed,
    /// options only when the caller or the configuration provides them.
    pub fn call_args(&self, metadata: Option<Metadata>, options: Option<CallOptions>) -> CallArgs {
        let metadata = match metadata {
            Some(metadata) => metadata.to_native(),
            None => self.default_metadata.to_native(),
        };
        match options.or_else(|| self.default_options.clone()) {
            Some(options) => CallArgs::MetadataOptions(metadata, options),
            None => CallArgs::Metadata(metadata),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NativeMetadata;

    #[test]
    fn bare_call_passes_empty_metadata_only() {
        let args = ClientConfig::new().call_args(None, None);
        assert_eq!(args, CallArgs::Metadata(NativeMetadata::new()));
    }

    #[test]
    fn explicit_values_win_over_defaults() {
        let config = ClientConfig::new()
            .with_metadata([("tenant", "default")].into_iter().collect())
            .with_options(CallOptions {
                host: Some("default".into()),
                ..Default::default()
            });
        let metadata: Metadata = [("tenant", "acme")].into_iter().collect();
        let options = CallOptions {
            propagate_flags: Some(3),
            ..Default::default()
        };

        let args = config.call_args(Some(metadata.clone()), Some(options.clone()));
        assert_eq!(args, CallArgs::MetadataOptions(metadata.to_native(), options));
    }

    #[test]
    fn configured_options_select_longer_arity() {
        let options = CallOptions {
            host: Some("backend".into()),
            ..Default::default()
        };
        let config = ClientConfig::new().with_options(options.clone());
        let args = config.call_args(None, None);
        assert_eq!(args.options(), Some(&options));
        assert!(args.metadata().is_empty());
    }
}
