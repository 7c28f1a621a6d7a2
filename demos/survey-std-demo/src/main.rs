use std::sync::Arc;

use embassy_executor::Spawner;
use embassy_futures::join::{join, join_array};
use embassy_time::{Duration, Timer};
use env_logger::Builder;
use log::{LevelFilter, log};
use moonblokz_survey_lib::radio_devices::simulator::{MediumConfiguration, Point, SimulatedMedium, SimulatedRadio, SimulatedRanging};
use moonblokz_survey_lib::{NodeIdentity, SlotEvent, SlotRouter, SurveyCompleteQueue, SurveyCompleteQueueReceiver, SurveyConfiguration, SurveyRegistry};

const NODE_COUNT: usize = 4;
const ROUND_PERIOD_US: u32 = 20_000;
const CELL_ID: u16 = 1;

type Registry = SurveyRegistry<SimulatedRadio, SimulatedRanging>;
type Router = SlotRouter<SimulatedRadio, SimulatedRanging>;

static SURVEY_COMPLETE_QUEUE: SurveyCompleteQueue = SurveyCompleteQueue::new();

fn slot_event(round_index: u32, slot_position: u16) -> SlotEvent {
    SlotEvent {
        round_index,
        slot_position,
        slot_period: ROUND_PERIOD_US,
        total_slots: 2,
        round_epoch: (round_index as u64 * ROUND_PERIOD_US as u64) << 16,
    }
}

#[embassy_executor::task]
async fn run_survey(medium: Arc<SimulatedMedium>, routers: &'static [Router; NODE_COUNT]) -> ! {
    let mut round_index: u32 = 0;
    loop {
        let ranging = slot_event(round_index, 0);
        join(join_array(core::array::from_fn::<_, NODE_COUNT, _>(|i| routers[i].on_ranging_slot(&ranging))), medium.run_slot()).await;

        let broadcast = slot_event(round_index, 1);
        let (outcomes, _) = join(join_array(core::array::from_fn::<_, NODE_COUNT, _>(|i| routers[i].on_broadcast_slot(&broadcast))), medium.run_slot()).await;
        for (slot_id, outcome) in outcomes.iter().enumerate() {
            if let Some(outcome) = outcome {
                if !outcome.status.is_ok() {
                    log!(log::Level::Warn, "[{}] Round {}: {:?} finished with {:?}", slot_id, round_index, outcome.role, outcome.status);
                }
            }
        }

        round_index = round_index.wrapping_add(1);
        Timer::after(Duration::from_millis(250)).await;
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    Builder::new().filter_level(LevelFilter::Info).init();

    let positions = [Point::new(0.0, 0.0), Point::new(12.0, 0.0), Point::new(12.0, 9.0), Point::new(0.0, 9.0)];
    let medium = SimulatedMedium::new(
        &positions,
        MediumConfiguration {
            radio_range: 40.0,
            loss_percent: 5,
            rng_seed: 42,
        },
    );

    let registry = Arc::new(Registry::new());
    for slot_id in 0..NODE_COUNT as u16 {
        let identity = NodeIdentity {
            short_address: 0x0A00 + slot_id,
            slot_id,
            cell_id: CELL_ID,
        };
        let created = registry.create(slot_id as u32, NODE_COUNT as u16, identity, SurveyConfiguration::default(), || {
            (medium.radio(slot_id), medium.ranging(slot_id))
        });
        if let Err(err) = created {
            log!(log::Level::Error, "Survey setup failed on node {}: {}", slot_id, err);
            return;
        }
    }

    let routers: &'static [Router; NODE_COUNT] = Box::leak(Box::new(core::array::from_fn(|device| {
        SlotRouter::new(registry.clone(), device as u32).notify_completion(SURVEY_COMPLETE_QUEUE.sender())
    })));
    let _ = spawner.spawn(run_survey(medium.clone(), routers));

    let completions: SurveyCompleteQueueReceiver = SURVEY_COMPLETE_QUEUE.receiver();
    loop {
        let complete = completions.receive().await;
        // every node queues its own notification, node 0 speaks for the fleet
        if complete.device != 0 {
            continue;
        }
        let Some(session) = registry.get(complete.device) else {
            continue;
        };
        let matrix = session.snapshot();
        log!(log::Level::Info, "Survey round {} complete, {} rows populated", complete.round_seq, matrix.populated_rows());
        for (from, row) in matrix.rows().enumerate() {
            let ranges: Vec<String> = row.iter().map(|(peer, distance)| format!("{}: {:.2}", peer, distance)).collect();
            log!(log::Level::Info, "  {} -> [{}]", from, ranges.join(", "));
        }
    }
}
