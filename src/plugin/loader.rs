//! Creates and configures the active set of traffic plugins.

use crate::config::{ConfigError, Document};
use crate::plugin::{is_registered, Plugin, PluginFactory};

/// Instantiates plugins from `factories` in order, configuring each from
/// the document section matching its name. An absent section reads as an
/// empty section. Factories that return `Ok(None)` are inactive and
/// skipped; any error aborts startup.
pub fn load(
    factories: &[Box<dyn PluginFactory>],
    document: &Document,
) -> Result<Vec<Box<dyn Plugin>>, ConfigError> {
    let mut plugins = Vec::new();

    for factory in factories {
        tracing::info!(plugin = factory.name(), "loading plugin");

        if !is_registered(factory.name()) {
            return Err(ConfigError::Plugin {
                plugin: factory.name().to_string(),
                source: Box::new(ConfigError::InvalidDocument(
                    "plugin is not registered; add it to the registry".to_string(),
                )),
            });
        }

        let section = document.section(factory.name());
        match factory.new_plugin(&section) {
            Ok(Some(plugin)) => plugins.push(plugin),
            Ok(None) => continue, // This plugin is inactive.
            Err(error) => {
                return Err(ConfigError::Plugin {
                    plugin: factory.name().to_string(),
                    source: Box::new(error),
                })
            }
        }
    }

    Ok(plugins)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::default_factories;

    struct UnregisteredFactory;

    impl PluginFactory for UnregisteredFactory {
        fn name(&self) -> &'static str {
            "definitely-not-registered"
        }

        fn new_plugin(&self, _section: &crate::config::Section) -> Result<Option<Box<dyn Plugin>>, ConfigError> {
            Ok(None)
        }
    }

    #[test]
    fn empty_document_activates_no_plugins() {
        let document = Document::new();
        let plugins = load(&default_factories(), &document).unwrap();
        assert!(plugins.is_empty());
    }

    #[test]
    fn configured_plugins_keep_registration_order() {
        let yaml = "\
cookies:
  allowlist: [SPECIAL_ID]
headers:
  override-origin: example.com
paths:
  routes:
    - path: ^/foo/
      target-path: /bar/
";
        let document = Document::from_yaml_str(yaml).unwrap();
        let plugins = load(&default_factories(), &document).unwrap();
        let names: Vec<_> = plugins.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["cookies", "headers", "paths"]);
    }

    #[test]
    fn unregistered_factories_are_refused() {
        let factories: Vec<Box<dyn PluginFactory>> = vec![Box::new(UnregisteredFactory)];
        let error = load(&factories, &Document::new()).unwrap_err();
        assert!(error.to_string().contains("not registered"));
    }

    #[test]
    fn configuration_errors_name_the_plugin() {
        let yaml = "paths:\n  routes:\n    - path: '['\n      target-path: /x/\n";
        let document = Document::from_yaml_str(yaml).unwrap();
        let error = load(&default_factories(), &document).unwrap_err();
        assert!(error.to_string().contains("\"paths\""), "got: {error}");
    }
}
