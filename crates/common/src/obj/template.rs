use serde_yaml::{Mapping, Value};

use crate::manifest::ManifestError;

use super::Container;

/// A storage template: partial storage definitions with placeholders filled
/// from a container at instantiation time.
///
/// Recognized placeholders are `{{ uuid }}`, `{{ title }}` and
/// `{{ owner }}`. Templates live in the template directory as plain YAML
/// lists (they are local configuration, not signed manifests).
#[derive(Debug, Clone)]
pub struct StorageTemplate {
    name: String,
    entries: Vec<Mapping>,
}

impl StorageTemplate {
    pub fn from_yaml(name: &str, yaml: &str) -> Result<Self, ManifestError> {
        let entries: Vec<Mapping> = serde_yaml::from_str(yaml)
            .map_err(|e| ManifestError::Parse(format!("template parse error: {e}")))?;
        if entries.is_empty() {
            return Err(ManifestError::Schema("template must not be empty".into()));
        }
        for entry in &entries {
            if entry.get("type").and_then(Value::as_str).is_none() {
                return Err(ManifestError::Schema(
                    "template entries must declare a storage type".into(),
                ));
            }
        }
        Ok(StorageTemplate {
            name: name.to_string(),
            entries,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instantiate the template for a container, producing inline storage
    /// mappings ready to be appended to `backends.storage`.
    pub fn fill(&self, container: &Container) -> Vec<Mapping> {
        self.entries
            .iter()
            .map(|entry| {
                entry
                    .iter()
                    .map(|(k, v)| (k.clone(), fill_value(v, container)))
                    .collect()
            })
            .collect()
    }
}

fn fill_value(value: &Value, container: &Container) -> Value {
    match value {
        Value::String(s) => {
            let filled = s
                .replace("{{ uuid }}", &container.uuid().to_string())
                .replace("{{ title }}", container.title().unwrap_or(""))
                .replace("{{ owner }}", container.owner().as_str());
            Value::String(filled)
        }
        Value::Mapping(map) => Value::Mapping(
            map.iter()
                .map(|(k, v)| (k.clone(), fill_value(v, container)))
                .collect(),
        ),
        Value::Sequence(seq) => {
            Value::Sequence(seq.iter().map(|v| fill_value(v, container)).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::manifest::Manifest;

    #[test]
    fn test_fill_placeholders() {
        let owner = "0x6f776e65726f776e65726f776e65726f776e65726f776e65726f776e65726f77";
        let yaml = format!(
            "version: \"1\"\nobject: container\nowner: \"{owner}\"\n\
             paths: [\"/.uuid/5c34712e-e0a8-4b67-9317-9c3dbb1a4282\"]\ntitle: notes\n\
             backends:\n  storage: []\n"
        );
        let manifest = Manifest::from_fields(serde_yaml::from_str(&yaml).unwrap()).unwrap();
        let container = Container::try_from(manifest).unwrap();

        let template =
            StorageTemplate::from_yaml("cache", "- type: local\n  location: \"/cache/{{ uuid }}\"\n")
                .unwrap();
        let filled = template.fill(&container);
        assert_eq!(
            filled[0].get("location").and_then(Value::as_str),
            Some("/cache/5c34712e-e0a8-4b67-9317-9c3dbb1a4282")
        );
    }
}
