//! Fixed catalog of the pretrained encoders this service can serve.

use serde::Serialize;

use crate::error::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Bert,
    Roberta,
    Albert,
}

impl Architecture {
    /// Prefix under which checkpoint tensors of this family are usually stored.
    pub fn weight_prefix(self) -> &'static str {
        match self {
            Architecture::Bert => "bert",
            Architecture::Roberta => "roberta",
            Architecture::Albert => "albert",
        }
    }

    /// RoBERTa numbers positions from `pad_token_id + 1`.
    pub fn position_offset(self, pad_token_id: i64) -> i64 {
        match self {
            Architecture::Roberta => pad_token_id + 1,
            Architecture::Bert | Architecture::Albert => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModelDescriptor {
    pub short_id: &'static str,
    pub repository_id: &'static str,
    pub architecture: Architecture,
}

const fn descriptor(
    short_id: &'static str,
    repository_id: &'static str,
    architecture: Architecture,
) -> ModelDescriptor {
    ModelDescriptor {
        short_id,
        repository_id,
        architecture,
    }
}

pub static CATALOG: [ModelDescriptor; 6] = [
    descriptor("bert-base-uncased", "google-bert/bert-base-uncased", Architecture::Bert),
    descriptor("bert-large-uncased", "google-bert/bert-large-uncased", Architecture::Bert),
    descriptor("roberta-base", "FacebookAI/roberta-base", Architecture::Roberta),
    descriptor("roberta-large", "FacebookAI/roberta-large", Architecture::Roberta),
    descriptor("albert-base-v1", "albert/albert-base-v1", Architecture::Albert),
    descriptor("albert-base-v2", "albert/albert-base-v2", Architecture::Albert),
];

pub fn resolve(short_id: &str) -> Result<&'static ModelDescriptor, ServiceError> {
    CATALOG
        .iter()
        .find(|d| d.short_id == short_id)
        .ok_or_else(|| ServiceError::UnknownModel {
            requested: short_id.to_string(),
            available: supported_ids().iter().map(|id| id.to_string()).collect(),
        })
}

pub fn supported_ids() -> Vec<&'static str> {
    CATALOG.iter().map(|d| d.short_id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_catalog_entry_resolves() {
        for entry in &CATALOG {
            let found = resolve(entry.short_id).unwrap();
            assert_eq!(found, entry);
        }
        assert_eq!(supported_ids().len(), 6);
    }

    #[test]
    fn repository_ids_are_canonical() {
        // Legacy un-namespaced names answer with a relative redirect the hub
        // client cannot follow.
        for entry in &CATALOG {
            let (owner, name) = entry
                .repository_id
                .split_once('/')
                .unwrap_or_else(|| panic!("{} is not owner/name", entry.repository_id));
            assert!(!owner.is_empty() && !name.is_empty(), "{}", entry.repository_id);
            assert!(!name.contains('/'), "{}", entry.repository_id);
            assert_eq!(name, entry.short_id);
        }
    }

    #[test]
    fn lookup_is_exact() {
        for name in ["BERT-base-uncased", "bert-base", "", " roberta-base", "gpt2"] {
            match resolve(name) {
                Err(ServiceError::UnknownModel { requested, available }) => {
                    assert_eq!(requested, name);
                    assert_eq!(available.len(), CATALOG.len());
                }
                other => panic!("expected UnknownModel for {name:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn architecture_tags() {
        assert_eq!(resolve("roberta-large").unwrap().architecture, Architecture::Roberta);
        assert_eq!(resolve("albert-base-v1").unwrap().architecture, Architecture::Albert);
        assert_eq!(Architecture::Roberta.position_offset(1), 2);
        assert_eq!(Architecture::Bert.position_offset(0), 0);
    }
}
