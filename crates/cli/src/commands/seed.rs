use crate::commands::{prepare, CommandResult};
use frontdesk_db::{connect_with_config, migrations, seed_demo_business, SeedResult};

pub fn run() -> CommandResult {
    let (config, runtime) = match prepare("seed") {
        Ok(prepared) => prepared,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;

        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let seeded = seed_demo_business(&pool)
            .await
            .map_err(|error| ("seed_execution", error.to_string(), 5u8));

        pool.close().await;
        seeded
    });

    match result {
        Ok(seeded) => CommandResult::success("seed", summary(&seeded)),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("seed", error_class, message, exit_code)
        }
    }
}

fn summary(seeded: &SeedResult) -> String {
    format!(
        "demo business `{}` loaded: {} services, {} open slots, {} activity rows",
        seeded.business_id, seeded.services, seeded.available_slots, seeded.activity_rows
    )
}

#[cfg(test)]
mod tests {
    use frontdesk_db::SeedResult;

    use super::summary;

    #[test]
    fn summary_lists_seeded_counts() {
        let seeded = SeedResult {
            business_id: "biz-1".to_string(),
            services: 3,
            available_slots: 6,
            activity_rows: 13,
        };

        assert_eq!(
            summary(&seeded),
            "demo business `biz-1` loaded: 3 services, 6 open slots, 13 activity rows"
        );
    }
}
