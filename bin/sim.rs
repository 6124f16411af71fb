use std::fs;
use std::path::PathBuf;
use std::process::exit;

use log::*;
use outbreak::prelude::*;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct VirusConfig {
    name: String,
    prob_infecting: Real,
    prob_recovery: Real,
    prob_death: Real,
    prevalence: Real,
    post_immunity: Option<Real>,
}

impl Default for VirusConfig {
    fn default() -> Self {
        VirusConfig {
            name: "virus".to_string(),
            prob_infecting: 0.3,
            prob_recovery: 0.15,
            prob_death: 0.0,
            prevalence: 0.01,
            post_immunity: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pop_size: usize,
    contacts: usize,
    rewire: Real,
    days: Day,
    seed: u64,
    sampling_freq: Day,
    verbose: bool,
    viruses: Vec<VirusConfig>,
    output_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pop_size: 1_000,
            contacts: 5,
            rewire: 0.01,
            days: 60,
            seed: 123,
            sampling_freq: 1,
            verbose: true,
            viruses: vec![VirusConfig::default()],
            output_dir: PathBuf::from("."),
        }
    }
}

fn build(config: &Config) -> Result<Model> {
    let mut model = Model::new();
    model.seed(config.seed);
    model.set_sampling_freq(config.sampling_freq);
    model
        .agents_smallworld(config.pop_size, config.contacts, config.rewire, false)?;

    // State codes of the standard susceptible/exposed/removed triple.
    let (infected, removed) = (1, 2);
    for vc in &config.viruses {
        let mut virus = Virus::new(vc.name.as_str());
        virus.set_prob_infecting(vc.prob_infecting)?;
        virus.set_prob_recovery(vc.prob_recovery)?;
        virus.set_prob_death(vc.prob_death)?;
        virus.set_state(Some(infected), Some(removed), Some(removed));
        if let Some(p) = vc.post_immunity {
            virus.set_post_immunity(p)?;
        }
        model.add_virus(virus, Prevalence::Proportion(vc.prevalence))?;
    }

    if config.verbose {
        model.verbose_on();
    }
    Ok(model)
}

fn execute(config: &Config) -> Result<()> {
    let mut model = build(config)?;
    model.run(config.days, config.seed)?;
    println!("{}", model);

    let dir = &config.output_dir;
    fs::create_dir_all(dir)?;
    model.db().write_variant_info(dir.join("variant_info.txt"))?;
    model.db().write_variant_hist(dir.join("variant_hist.txt"))?;
    model.db().write_total_hist(dir.join("total_hist.txt"))?;
    model.db().write_transmissions(dir.join("transmission.txt"))?;
    model.db().write_transitions(dir.join("transition.txt"))?;
    model.write_edgelist(dir.join("edgelist.txt"))?;

    let mut diagram = ModelDiagram::new();
    let graph = diagram.draw(
        dir.join("transition.txt"),
        Some(dir.join("diagram.mmd").as_path()),
        false,
    )?;
    debug!("transition diagram:\n{}", graph);

    let (last, _total, _n) = model.elapsed();
    info!("wrote outputs to {:?} ({:.2?})", dir, last.unwrap_or_default());
    Ok(())
}

fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .init()
        .ok();

    let config = match std::env::args().nth(1) {
        Some(path) => match fs::read_to_string(&path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    error!("bad config {}: {}", path, e);
                    exit(1);
                }
            },
            Err(e) => {
                error!("cannot read {}: {}", path, e);
                exit(1);
            }
        },
        None => {
            info!("no config given; running the default scenario");
            Config::default()
        }
    };

    if let Err(e) = execute(&config) {
        error!("simulation failed: {}", e);
        exit(1);
    }
}
