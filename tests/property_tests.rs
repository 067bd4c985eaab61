//! Property-based tests using proptest to verify invariants

use duratask::blob_store::BlobStore;
use duratask::range_files::{parse_ranges, NumberRange, RangeParseError, DURABLE_EXAMPLE};
use duratask::{ActivityContext, ActivityRegistry, Client, OrchestrationContext, OrchestrationRegistry, OrchestrationStatus, Runtime};
use proptest::prelude::*;
use std::time::Duration;

mod common;

fn arb_range() -> impl Strategy<Value = (i64, i64)> {
    (-1_000i64..1_000, 0i64..200).prop_map(|(start, len)| (start, start + len))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: rendering a list of ranges and parsing it back preserves order and bounds
    #[test]
    fn prop_range_list_roundtrip(ranges in prop::collection::vec(arb_range(), 1..8)) {
        let input = ranges
            .iter()
            .map(|(s, e)| format!("{s}-{e}"))
            .collect::<Vec<_>>()
            .join(",");
        let parsed = parse_ranges(&input).unwrap();
        let expected: Vec<NumberRange> = ranges.iter().map(|&(start, end)| NumberRange { start, end }).collect();
        prop_assert_eq!(parsed, expected);
    }

    /// Property: a rendered file holds exactly end - start + 1 newline-terminated numbers
    #[test]
    fn prop_render_line_count((start, end) in arb_range()) {
        let text = NumberRange { start, end }.render();
        prop_assert!(text.ends_with('\n'));
        let lines: Vec<i64> = text.lines().map(|l| l.parse().unwrap()).collect();
        prop_assert_eq!(lines.len() as i64, end - start + 1);
        prop_assert_eq!(lines.first().copied(), Some(start));
        prop_assert_eq!(lines.last().copied(), Some(end));
    }

    /// Property: ranges that end before they start are always rejected
    #[test]
    fn prop_reversed_rejected(start in -1_000i64..1_000, gap in 1i64..100) {
        let end = start - gap;
        prop_assert_eq!(
            parse_ranges(&format!("{start}-{end}")),
            Err(RangeParseError::Reversed { start, end })
        );
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Property: fan-in returns outputs in item order regardless of completion order
    #[test]
    fn prop_fan_in_preserves_order(delays in prop::collection::vec(0u64..20, 1..6)) {
        let outputs = tokio::runtime::Runtime::new().unwrap().block_on(async {
            let store = common::create_in_memory_store();
            let activities = ActivityRegistry::builder()
                .register("Delay", |_ctx: ActivityContext, input: String| async move {
                    let (idx, ms) = input.split_once(':').unwrap_or(("?", "0"));
                    tokio::time::sleep(Duration::from_millis(ms.parse().unwrap_or(0))).await;
                    Ok(idx.to_string())
                })
                .build();
            let orchestrations = OrchestrationRegistry::builder()
                .register("FanIn", |ctx: OrchestrationContext, input: String| async move {
                    let items: Vec<(&str, String)> = input.split(',').map(|i| ("Delay", i.to_string())).collect();
                    ctx.fan_out(items)
                        .await
                        .map(|outs| outs.join(","))
                        .map_err(String::from)
                })
                .build();
            let rt = Runtime::start_with_options(store.clone(), activities, orchestrations, common::fast_options())
                .await
                .unwrap();
            let input = delays
                .iter()
                .enumerate()
                .map(|(i, ms)| format!("{i}:{ms}"))
                .collect::<Vec<_>>()
                .join(",");
            let client = Client::new(store);
            let instance = client.start_orchestration("FanIn", input).await.unwrap();
            let status = client.wait_for_orchestration(&instance, Duration::from_secs(10)).await;
            rt.shutdown(None).await;
            status
        });
        let expected = (0..delays.len()).map(|i| i.to_string()).collect::<Vec<_>>().join(",");
        prop_assert_eq!(outputs, Ok(OrchestrationStatus::Completed { output: expected }));
    }

    /// Property: every range in the sample input produces exactly one blob
    #[test]
    fn prop_sample_writes_one_blob_per_range(ranges in prop::collection::vec(arb_range(), 1..4)) {
        let (listed, status) = tokio::runtime::Runtime::new().unwrap().block_on(async {
            let store = common::create_in_memory_store();
            let blobs = common::in_memory_blobs();
            let rt = common::start_range_runtime(store.clone(), blobs.clone()).await;
            let input = ranges
                .iter()
                .map(|(s, e)| format!("{s}-{e}"))
                .collect::<Vec<_>>()
                .join(",");
            let client = Client::new(store);
            let instance = client.start_orchestration(DURABLE_EXAMPLE, input).await.unwrap();
            let status = client.wait_for_orchestration(&instance, Duration::from_secs(10)).await;
            rt.shutdown(None).await;
            (blobs.list().await.unwrap(), status)
        });
        let mut expected: Vec<String> = ranges.iter().map(|(s, e)| format!("{s}-{e}.txt")).collect();
        let json = serde_json::to_string(&expected).unwrap();
        prop_assert_eq!(status, Ok(OrchestrationStatus::Completed { output: json }));
        expected.sort();
        expected.dedup();
        prop_assert_eq!(listed, expected);
    }
}
