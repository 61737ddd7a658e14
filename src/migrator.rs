use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20250101_000001_create_catalog_tables::Migration),
            Box::new(m20250101_000002_create_cart_tables::Migration),
            Box::new(m20250101_000003_create_order_tables::Migration),
            Box::new(m20250101_000004_create_payment_tables::Migration),
        ]
    }
}

mod m20250101_000001_create_catalog_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000001_create_catalog_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Products::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Products::ShopId).uuid().not_null())
                        .col(ColumnDef::new(Products::Name).string().not_null())
                        .col(
                            ColumnDef::new(Products::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Products::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // Variant stock is guarded by conditional updates; the check
            // constraint is a second line of defence on Postgres.
            manager
                .create_table(
                    Table::create()
                        .table(ProductVariants::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(ProductVariants::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(ProductVariants::ProductId).uuid().not_null())
                        .col(ColumnDef::new(ProductVariants::Sku).string().not_null())
                        .col(ColumnDef::new(ProductVariants::Name).string().not_null())
                        .col(
                            ColumnDef::new(ProductVariants::Price)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ProductVariants::Currency)
                                .string_len(3)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ProductVariants::Stock)
                                .integer()
                                .not_null()
                                .default(0)
                                .check(Expr::col(ProductVariants::Stock).gte(0)),
                        )
                        .col(
                            ColumnDef::new(ProductVariants::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(ProductVariants::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_product_variants_product_id")
                                .from(ProductVariants::Table, ProductVariants::ProductId)
                                .to(Products::Table, Products::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Promotions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Promotions::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Promotions::VariantId).uuid().not_null())
                        .col(ColumnDef::new(Promotions::Name).string().not_null())
                        .col(
                            ColumnDef::new(Promotions::DiscountType)
                                .string_len(20)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Promotions::DiscountValue)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Promotions::StartDate)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Promotions::EndDate)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Promotions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_promotions_variant_id")
                                .from(Promotions::Table, Promotions::VariantId)
                                .to(ProductVariants::Table, ProductVariants::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_promotions_variant_window")
                        .table(Promotions::Table)
                        .col(Promotions::VariantId)
                        .col(Promotions::StartDate)
                        .col(Promotions::EndDate)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Promotions::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(ProductVariants::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Products {
        Table,
        Id,
        ShopId,
        Name,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum ProductVariants {
        Table,
        Id,
        ProductId,
        Sku,
        Name,
        Price,
        Currency,
        Stock,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Promotions {
        Table,
        Id,
        VariantId,
        Name,
        DiscountType,
        DiscountValue,
        StartDate,
        EndDate,
        CreatedAt,
    }
}

mod m20250101_000002_create_cart_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000002_create_cart_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Carts::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Carts::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Carts::UserId).uuid().not_null())
                        .col(ColumnDef::new(Carts::ShopId).uuid().not_null())
                        .col(
                            ColumnDef::new(Carts::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Carts::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_carts_user_shop")
                        .table(Carts::Table)
                        .col(Carts::UserId)
                        .col(Carts::ShopId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            // No foreign key to product_variants: a deleted variant must stay
            // visible in the cart so checkout can report it.
            manager
                .create_table(
                    Table::create()
                        .table(CartItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(CartItems::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(CartItems::CartId).uuid().not_null())
                        .col(ColumnDef::new(CartItems::VariantId).uuid().not_null())
                        .col(ColumnDef::new(CartItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(CartItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_cart_items_cart_id")
                                .from(CartItems::Table, CartItems::CartId)
                                .to(Carts::Table, Carts::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_cart_items_cart_variant")
                        .table(CartItems::Table)
                        .col(CartItems::CartId)
                        .col(CartItems::VariantId)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(CartItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Carts::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Carts {
        Table,
        Id,
        UserId,
        ShopId,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum CartItems {
        Table,
        Id,
        CartId,
        VariantId,
        Quantity,
        CreatedAt,
    }
}

mod m20250101_000003_create_order_tables {
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000003_create_order_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Orders::ShopId).uuid().not_null())
                        .col(ColumnDef::new(Orders::UserId).uuid().null())
                        .col(ColumnDef::new(Orders::Status).string_len(20).not_null())
                        .col(
                            ColumnDef::new(Orders::TotalAmount)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(ColumnDef::new(Orders::Currency).string_len(3).not_null())
                        .col(
                            ColumnDef::new(Orders::ExpiresAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // The expiry sweep scans by status and deadline.
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_status_expires_at")
                        .table(Orders::Table)
                        .col(Orders::Status)
                        .col(Orders::ExpiresAt)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_user_id")
                        .table(Orders::Table)
                        .col(Orders::UserId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OrderItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OrderItems::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(OrderItems::OrderId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::VariantId).uuid().not_null())
                        .col(ColumnDef::new(OrderItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(OrderItems::Price)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(OrderItems::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_items_order_id")
                                .from(OrderItems::Table, OrderItems::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Orders {
        Table,
        Id,
        ShopId,
        UserId,
        Status,
        TotalAmount,
        Currency,
        ExpiresAt,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum OrderItems {
        Table,
        Id,
        OrderId,
        VariantId,
        Quantity,
        Price,
        CreatedAt,
    }
}

mod m20250101_000004_create_payment_tables {
    use super::m20250101_000003_create_order_tables::Orders;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20250101_000004_create_payment_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Payments::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Payments::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Payments::OrderId).uuid().not_null())
                        .col(ColumnDef::new(Payments::Status).string_len(20).not_null())
                        .col(ColumnDef::new(Payments::Method).string_len(32).not_null())
                        .col(
                            ColumnDef::new(Payments::Amount)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(ColumnDef::new(Payments::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Payments::ProviderId).string().null())
                        .col(ColumnDef::new(Payments::Metadata).json().not_null())
                        .col(
                            ColumnDef::new(Payments::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Payments::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_payments_order_id")
                                .from(Payments::Table, Payments::OrderId)
                                .to(Orders::Table, Orders::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payments_order_status")
                        .table(Payments::Table)
                        .col(Payments::OrderId)
                        .col(Payments::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Refunds::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Refunds::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Refunds::OrderId).uuid().not_null())
                        .col(ColumnDef::new(Refunds::PaymentId).uuid().not_null())
                        .col(
                            ColumnDef::new(Refunds::Amount)
                                .decimal_len(16, 4)
                                .not_null(),
                        )
                        .col(ColumnDef::new(Refunds::Reason).text().null())
                        .col(ColumnDef::new(Refunds::Status).string_len(20).not_null())
                        .col(ColumnDef::new(Refunds::RequestedBy).uuid().null())
                        .col(ColumnDef::new(Refunds::ProcessedBy).uuid().null())
                        .col(ColumnDef::new(Refunds::ProviderRefundId).string().null())
                        .col(
                            ColumnDef::new(Refunds::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Refunds::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_refunds_order_id")
                                .from(Refunds::Table, Refunds::OrderId)
                                .to(Orders::Table, Orders::Id),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_refunds_payment_id")
                                .from(Refunds::Table, Refunds::PaymentId)
                                .to(Payments::Table, Payments::Id),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Refunds::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Payments::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Payments {
        Table,
        Id,
        OrderId,
        Status,
        Method,
        Amount,
        Currency,
        ProviderId,
        Metadata,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum Refunds {
        Table,
        Id,
        OrderId,
        PaymentId,
        Amount,
        Reason,
        Status,
        RequestedBy,
        ProcessedBy,
        ProviderRefundId,
        CreatedAt,
        UpdatedAt,
    }
}
