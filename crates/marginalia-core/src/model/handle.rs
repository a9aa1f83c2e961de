//! Tagged model handle resolved once per request

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::{AdaptedModel, LanguageModel};
use crate::policy::FeedbackPolicy;
use crate::UserId;

/// Which flavour of model a handle carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Base,
    Adapted,
    Reinforced,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Base => "base",
            Self::Adapted => "adapted",
            Self::Reinforced => "reinforced",
        };
        f.write_str(name)
    }
}

/// A backbone model whose decode mode is chosen by the feedback policy
#[derive(Clone)]
pub struct ReinforcedModel {
    backbone: Arc<dyn LanguageModel>,
    adapter_owner: Option<UserId>,
    policy: Arc<FeedbackPolicy>,
}

impl ReinforcedModel {
    pub fn backbone(&self) -> &Arc<dyn LanguageModel> {
        &self.backbone
    }

    pub fn policy(&self) -> &Arc<FeedbackPolicy> {
        &self.policy
    }
}

/// The model used for one generation request.
///
/// Selected when the engine resolves a user's model, so decoding never has to
/// inspect what kind of model it was given.
#[derive(Clone)]
pub enum ModelHandle {
    /// Shared base model, used when the user has no adapter
    Base(Arc<dyn LanguageModel>),
    /// Base model with one user's adapter overlaid
    Adapted(Arc<AdaptedModel>),
    /// Base or adapted model steered by the feedback policy
    Reinforced(ReinforcedModel),
}

impl ModelHandle {
    pub fn base(model: Arc<dyn LanguageModel>) -> Self {
        Self::Base(model)
    }

    pub fn adapted(model: AdaptedModel) -> Self {
        Self::Adapted(Arc::new(model))
    }

    pub fn kind(&self) -> ModelKind {
        match self {
            Self::Base(_) => ModelKind::Base,
            Self::Adapted(_) => ModelKind::Adapted,
            Self::Reinforced(_) => ModelKind::Reinforced,
        }
    }

    /// The model to run forward steps against
    pub fn language_model(&self) -> Arc<dyn LanguageModel> {
        match self {
            Self::Base(model) => Arc::clone(model),
            Self::Adapted(model) => model.clone() as Arc<dyn LanguageModel>,
            Self::Reinforced(reinforced) => Arc::clone(&reinforced.backbone),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Base(model) => model.name(),
            Self::Adapted(model) => model.name(),
            Self::Reinforced(reinforced) => reinforced.backbone.name(),
        }
    }

    /// User whose adapter this handle applies, if any
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Self::Base(_) => None,
            Self::Adapted(model) => Some(model.user_id()),
            Self::Reinforced(reinforced) => reinforced.adapter_owner,
        }
    }

    /// Put the handle under control of `policy`
    pub fn reinforce(self, policy: Arc<FeedbackPolicy>) -> Self {
        let (backbone, adapter_owner) = match self {
            Self::Base(model) => (model, None),
            Self::Adapted(model) => {
                let owner = model.user_id();
                (model as Arc<dyn LanguageModel>, Some(owner))
            }
            Self::Reinforced(reinforced) => (reinforced.backbone, reinforced.adapter_owner),
        };
        Self::Reinforced(ReinforcedModel {
            backbone,
            adapter_owner,
            policy,
        })
    }

    pub fn policy(&self) -> Option<&Arc<FeedbackPolicy>> {
        match self {
            Self::Reinforced(reinforced) => Some(&reinforced.policy),
            _ => None,
        }
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("kind", &self.kind())
            .field("name", &self.name())
            .field("user_id", &self.user_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterBundle;
    use crate::config::PolicyConfig;
    use crate::model::{ModelConfig, NoteModel};

    #[test]
    fn test_kinds_and_owners() {
        let base = Arc::new(NoteModel::random(ModelConfig::new("base", 8, 4), 1).unwrap());
        let handle = ModelHandle::base(base.clone());
        assert_eq!(handle.kind(), ModelKind::Base);
        assert_eq!(handle.user_id(), None);
        assert!(handle.policy().is_none());

        let bundle = Arc::new(AdapterBundle::initialized(7, "base", 4, 8, 2, 16.0, 1));
        let adapted = ModelHandle::adapted(AdaptedModel::new(base, bundle, 7).unwrap());
        assert_eq!(adapted.kind(), ModelKind::Adapted);
        assert_eq!(adapted.user_id(), Some(7));

        let policy = Arc::new(FeedbackPolicy::new(&PolicyConfig::default()));
        let reinforced = adapted.reinforce(policy);
        assert_eq!(reinforced.kind(), ModelKind::Reinforced);
        assert_eq!(reinforced.user_id(), Some(7));
        assert!(reinforced.policy().is_some());
        assert_eq!(reinforced.language_model().vocab_size(), 8);
    }
}
