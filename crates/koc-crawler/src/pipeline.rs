use std::collections::HashMap;

use anyhow::{anyhow, Context};

use crate::config::Settings;
use crate::feed::Item;

/// A post-processing stage for scraped items.
pub trait ItemPipeline: Send {
    fn open(&mut self, _settings: &Settings) -> anyhow::Result<()> {
        Ok(())
    }

    /// Returns the item to pass on, or `None` to drop it.
    fn process_item(&mut self, item: Item) -> anyhow::Result<Option<Item>>;

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

type PipelineFactory = Box<dyn Fn() -> Box<dyn ItemPipeline> + Send + Sync>;

/// Pipeline implementations available to `ITEM_PIPELINES`, by identifier.
#[derive(Default)]
pub struct PipelineRegistry {
    factories: HashMap<String, PipelineFactory>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, P>(&mut self, id: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: ItemPipeline + 'static,
    {
        self.factories.insert(
            id.into(),
            Box::new(move || Box::new(factory()) as Box<dyn ItemPipeline>),
        );
        self
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    /// Builds and opens the enabled pipelines, lowest priority first.
    pub fn build(&self, settings: &Settings) -> anyhow::Result<PipelineChain> {
        let mut enabled = settings.item_pipelines.iter().collect::<Vec<_>>();
        enabled.sort_by(|(a_id, a_prio), (b_id, b_prio)| {
            a_prio.cmp(b_prio).then(a_id.cmp(b_id))
        });

        let mut stages = Vec::with_capacity(enabled.len());
        for (id, priority) in enabled {
            let factory = self
                .factories
                .get(id)
                .ok_or_else(|| anyhow!("Pipeline `{id}` is not registered"))?;
            let mut stage = factory();
            stage
                .open(settings)
                .with_context(|| format!("Couldn't open pipeline {id}"))?;
            log::debug!("Enabled pipeline {id} ({priority})");
            stages.push((id.clone(), stage));
        }

        Ok(PipelineChain { stages })
    }
}

/// Opened pipelines in processing order.
pub struct PipelineChain {
    stages: Vec<(String, Box<dyn ItemPipeline>)>,
}

impl PipelineChain {
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|(id, _)| id.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs `item` through every stage, stopping at the first drop.
    pub fn process(&mut self, item: Item) -> anyhow::Result<Option<Item>> {
        let mut item = item;
        for (id, stage) in &mut self.stages {
            match stage
                .process_item(item)
                .with_context(|| format!("Pipeline {id} failed"))?
            {
                Some(processed) => item = processed,
                None => {
                    log::debug!("Dropped item in pipeline {id}");
                    return Ok(None);
                }
            }
        }
        Ok(Some(item))
    }

    pub fn close(mut self) -> anyhow::Result<()> {
        for (id, stage) in &mut self.stages {
            stage
                .close()
                .with_context(|| format!("Couldn't close pipeline {id}"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use serde_json::{json, Value};

    use super::*;

    struct Tag {
        name: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ItemPipeline for Tag {
        fn process_item(&mut self, mut item: Item) -> anyhow::Result<Option<Item>> {
            self.seen.lock().unwrap().push(self.name);
            item.insert(self.name.to_string(), Value::Bool(true));
            Ok(Some(item))
        }
    }

    struct DropAll;

    impl ItemPipeline for DropAll {
        fn process_item(&mut self, _item: Item) -> anyhow::Result<Option<Item>> {
            Ok(None)
        }
    }

    fn settings(pipelines: &[(&str, i32)]) -> Settings {
        Settings {
            item_pipelines: pipelines
                .iter()
                .map(|(id, prio)| (id.to_string(), *prio))
                .collect::<BTreeMap<_, _>>(),
            ..Default::default()
        }
    }

    fn registry(seen: &Arc<Mutex<Vec<&'static str>>>) -> PipelineRegistry {
        let mut registry = PipelineRegistry::new();
        for name in ["first", "second"] {
            let seen = seen.clone();
            registry.register(format!("koc_crawler.pipelines.{name}"), move || Tag {
                name,
                seen: seen.clone(),
            });
        }
        registry.register("koc_crawler.pipelines.DropAll", || DropAll);
        registry
    }

    #[test]
    fn ordered_by_priority() {
        let seen = Arc::new(Mutex::new(vec![]));
        let settings = settings(&[
            ("koc_crawler.pipelines.second", 300),
            ("koc_crawler.pipelines.first", 100),
        ]);
        let mut chain = registry(&seen).build(&settings).unwrap();
        assert_eq!(
            chain.ids().collect::<Vec<_>>(),
            vec!["koc_crawler.pipelines.first", "koc_crawler.pipelines.second"]
        );

        let item = chain
            .process(json!({"name": "Ann"}).as_object().unwrap().clone())
            .unwrap()
            .unwrap();
        assert_eq!(item["first"], true);
        assert_eq!(item["second"], true);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
        chain.close().unwrap();
    }

    #[test]
    fn drop_stops_the_chain() {
        let seen = Arc::new(Mutex::new(vec![]));
        let settings = settings(&[
            ("koc_crawler.pipelines.DropAll", 100),
            ("koc_crawler.pipelines.first", 200),
        ]);
        let mut chain = registry(&seen).build(&settings).unwrap();
        assert!(chain.process(Item::new()).unwrap().is_none());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn unregistered_pipeline() {
        let settings = settings(&[("koc_crawler.pipelines.KocCrawlerPipeline", 300)]);
        let err = PipelineRegistry::new().build(&settings).err().unwrap();
        assert_eq!(
            err.to_string(),
            "Pipeline `koc_crawler.pipelines.KocCrawlerPipeline` is not registered"
        );
    }

    #[test]
    fn no_pipelines_by_default() {
        let mut chain = PipelineRegistry::new().build(&Settings::default()).unwrap();
        assert!(chain.is_empty());
        let item = json!({"a": 1}).as_object().unwrap().clone();
        assert_eq!(chain.process(item.clone()).unwrap(), Some(item));
    }
}
