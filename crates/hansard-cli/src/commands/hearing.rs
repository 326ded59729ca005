//! `hansard hearing` - manage hearing metadata rows.

use anyhow::Result;
use hansard_core::{HearingStore, PipelineConfig};

use crate::args::HearingAction;

pub fn run(action: HearingAction) -> Result<()> {
    let config = PipelineConfig::load()?;
    let store = HearingStore::open(&config.db_path)?;

    match action {
        HearingAction::Add {
            id,
            title,
            committee,
            date,
        } => {
            store.upsert_hearing(&id, &title, &committee, &date)?;
            println!("hearing {id} saved");
        }
        HearingAction::Show { id } => match store.hearing(&id)? {
            Some(record) => {
                println!("id:        {}", record.id);
                println!("title:     {}", record.title);
                println!("committee: {}", record.committee);
                println!("date:      {}", record.date);
                println!("stage:     {}", record.processing_stage);
                println!("updated:   {}", record.updated_at);
                if let Some(text) = &record.full_text_content {
                    let words = text.split_whitespace().count();
                    println!("transcript: {words} words");
                }
            }
            None => anyhow::bail!("hearing {id} not found"),
        },
    }
    Ok(())
}
