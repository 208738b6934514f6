/*!
Symbion DevKit - Harness de tests pour le banc de charge

Outils partagés par les tests de scénarios :
- `FleetHarness` : flottes à intervalles courts et aléa déterministe
- `EventRecorder` : capture et indexation du flux d'événements d'une flotte
- `scenario_test!` : test tokio en temps virtuel avec harness prêt à l'emploi
*/

pub mod event_recorder;
pub mod test_utils;

pub use event_recorder::EventRecorder;
pub use test_utils::{FleetHarness, HarnessResult};
