//! `hansard setup` - store the speech API key.

use anyhow::Result;
use dialoguer::Password;

pub fn run() -> Result<()> {
    if hansard_core::credentials::lookup_api_key().is_some() {
        println!("An API key is already configured; entering a new one replaces it.");
    }
    println!("Get your API key from: https://platform.openai.com/api-keys");

    let api_key = loop {
        let api_key = Password::new().with_prompt("OpenAI API key").interact()?;
        if api_key.starts_with("sk-") {
            break api_key;
        }
        eprintln!("Invalid key format. Keys start with 'sk-'.");
    };

    hansard_core::credentials::store_api_key(&api_key)?;
    println!("API key stored in the system keyring.");
    Ok(())
}
